//! WebSocket framing helpers over axum's socket type.
//!
//! Every protocol message travels as one JSON text frame. Binary frames are
//! ignored; pings are answered by axum itself.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use rtty_core::{encode_server, RttyError, RttyResult, ServerMessage};
use std::borrow::Cow;

/// Maximum inbound frame size. Large enough for a base64 image at the
/// default upload cap.
pub const MAX_WS_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Close code for connections refused because the relay is full.
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4008;

/// Close code sent when the session ends.
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub type WsSink = SplitSink<WebSocket, Message>;

/// Send one protocol message as a text frame.
pub async fn ws_send_message(sink: &mut WsSink, msg: &ServerMessage) -> RttyResult<()> {
    let text = encode_server(msg)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| RttyError::Transport(format!("WS send failed: {e}")))
}

/// Send a heartbeat ping.
pub async fn ws_send_ping(sink: &mut WsSink) -> RttyResult<()> {
    sink.send(Message::Ping(Vec::new()))
        .await
        .map_err(|e| RttyError::Transport(format!("WS ping failed: {e}")))
}

/// Close the socket with `code`, ignoring errors from an already-dead peer.
pub async fn ws_close(sink: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

/// Close an unsplit socket, used before a connection is admitted.
pub async fn ws_reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
