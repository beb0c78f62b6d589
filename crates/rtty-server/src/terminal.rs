//! Local terminal: raw mode, size, keystroke forwarding, and resize events.
//!
//! The local terminal is one more participant in the session. Its keystrokes
//! go to the PTY like a remote client's, and its size takes part in size
//! arbitration.

use crate::relay::RelayState;
use anyhow::{Context, Result};
use crossterm::terminal;
use std::io::{IsTerminal, Read};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Size used when stdout is not a terminal.
pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// RAII guard that restores cooked mode on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Whether stdin is an interactive terminal.
pub fn stdin_is_tty() -> bool {
    std::io::stdin().is_terminal()
}

/// Current local size as (columns, rows), or the fallback.
pub fn local_size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => FALLBACK_SIZE,
    }
}

/// Copy local keystrokes to the PTY until stdin closes.
///
/// Runs on a plain thread since stdin reads cannot be cancelled; the thread
/// dies with the process.
pub fn forward_stdin(relay: Arc<RelayState>) {
    let spawned = std::thread::Builder::new()
        .name("rtty-stdin".into())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => relay.write_input(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "stdin closed");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start stdin forwarder");
    }
}

/// Feed local window-size changes into size arbitration.
#[cfg(unix)]
pub fn watch_resize(relay: Arc<RelayState>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot watch terminal resizes");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let (cols, rows) = local_size();
            debug!(cols, rows, "local terminal resized");
            relay.set_local_size(cols, rows);
        }
    }))
}

#[cfg(not(unix))]
pub fn watch_resize(_relay: Arc<RelayState>) -> Option<JoinHandle<()>> {
    None
}
