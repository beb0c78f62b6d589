//! rtty-core: Shared protocol library for rtty (relay tty).
//!
//! Provides the JSON message types exchanged between the relay and browser
//! clients, the message codec, and the process-lifetime session token.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, encode_server};
pub use error::{RttyError, RttyResult};
pub use messages::{ClientMessage, ServerMessage};
pub use token::{generate_token, safe_equal};
