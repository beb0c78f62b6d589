//! Relay protocol engine: shared state, per-connection protocol, size
//! arbitration, uploads, and the HTTP/WebSocket surface.

pub mod connection;
pub mod http;
pub mod sizing;
pub mod state;
pub mod upload;

pub use http::RelayServer;
pub use state::RelayState;
