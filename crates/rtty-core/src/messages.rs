//! rtty wire messages.
//!
//! One WebSocket text frame carries exactly one JSON object whose `type`
//! field selects the variant. Field names follow the browser client's
//! camelCase convention (`lastSeq`).

use serde::{Deserialize, Serialize};

/// Messages sent by a browser client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Resume request carrying the newest sequence number the client has seen.
    /// Absent or `null` means the client has nothing yet.
    #[serde(rename = "sync")]
    Sync {
        #[serde(rename = "lastSeq", default)]
        last_seq: Option<u64>,
    },

    /// Keystrokes, forwarded verbatim to the PTY.
    #[serde(rename = "input")]
    Input { data: String },

    /// The client's viewport size. Validated by the relay before use.
    #[serde(rename = "resize")]
    Resize { cols: i64, rows: i64 },

    /// A base64-encoded image to drop into the scratch directory.
    #[serde(rename = "image_upload")]
    ImageUpload {
        data: String,
        #[serde(default)]
        filename: Option<String>,
    },
}

/// Messages sent by the relay to browser clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// One PTY output chunk.
    #[serde(rename = "output")]
    Output { seq: u64, data: String },

    /// The entire retained log, oldest first.
    #[serde(rename = "history")]
    History {
        data: Vec<String>,
        #[serde(rename = "lastSeq")]
        last_seq: u64,
    },

    /// Only the chunks after the client's watermark.
    #[serde(rename = "history-delta")]
    HistoryDelta {
        data: Vec<String>,
        #[serde(rename = "lastSeq")]
        last_seq: u64,
    },

    /// The PTY process terminated.
    #[serde(rename = "exit")]
    Exit { code: i32 },

    /// Result of an `image_upload`: exactly one of `path` / `error` is set.
    #[serde(rename = "image_uploaded")]
    ImageUploaded {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
}

impl ServerMessage {
    /// Successful upload reply.
    pub fn uploaded(path: impl Into<String>) -> Self {
        ServerMessage::ImageUploaded {
            path: Some(path.into()),
            error: None,
        }
    }

    /// Rejected upload reply.
    pub fn upload_failed(error: impl Into<String>) -> Self {
        ServerMessage::ImageUploaded {
            path: None,
            error: Some(error.into()),
        }
    }
}
