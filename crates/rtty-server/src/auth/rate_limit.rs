//! Per-connection message rate limiting.
//!
//! Each connection counts messages inside a fixed-length window that restarts
//! with the first message after it lapses. Messages over the ceiling are
//! dropped by the caller; the connection itself is never penalized.

use std::time::{Duration, Instant};

/// Message counter for one connection.
#[derive(Debug)]
pub struct MessageRateLimiter {
    /// Maximum messages accepted per window.
    max_messages: u32,
    /// Length of one window.
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl MessageRateLimiter {
    /// Create a limiter whose first window starts now.
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self::starting_at(max_messages, window, Instant::now())
    }

    fn starting_at(max_messages: u32, window: Duration, now: Instant) -> Self {
        Self {
            max_messages,
            window,
            window_start: now,
            count: 0,
        }
    }

    /// Record a message arriving now. Returns `true` if it may be processed.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    /// Record a message arriving at `now`. Returns `true` if it may be processed.
    pub fn check_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count >= self.max_messages {
            return false;
        }

        self.count += 1;
        true
    }
}
