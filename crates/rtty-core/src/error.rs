use thiserror::Error;

/// Errors produced by the rtty relay and its supervisors.
#[derive(Debug, Error)]
pub enum RttyError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RttyError {
    fn from(e: serde_json::Error) -> Self {
        RttyError::Codec(e.to_string())
    }
}

pub type RttyResult<T> = Result<T, RttyError>;
