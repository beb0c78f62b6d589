//! Authentication and rate limiting.

pub mod gate;
pub mod rate_limit;

pub use gate::{is_authorized, origin_matches, session_cookie};
pub use rate_limit::MessageRateLimiter;
