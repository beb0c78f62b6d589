//! Per-connection protocol handling.
//!
//! A [`ClientSession`] lives exactly as long as its WebSocket. Inbound
//! frames pass the rate gate, are decoded, and are dispatched against the
//! shared [`RelayState`]. Everything sent back travels through the
//! connection's outbound queue so replies and broadcast output share one
//! ordering.

use super::state::{ClientId, RelayState};
use crate::auth::MessageRateLimiter;
use crate::transport::websocket::{
    self, WsSink, CLOSE_GOING_AWAY, CLOSE_TOO_MANY_CONNECTIONS,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use rtty_core::{decode_client, ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const MAX_COLS: i64 = 500;
pub const MAX_ROWS: i64 = 200;

/// State private to one connection.
#[derive(Debug)]
pub struct ClientSession {
    pub id: ClientId,
    pub size: Option<(u16, u16)>,
    pub has_synced_once: bool,
    rate: MessageRateLimiter,
}

impl ClientSession {
    pub fn new(id: ClientId, rate: MessageRateLimiter) -> Self {
        Self {
            id,
            size: None,
            has_synced_once: false,
            rate,
        }
    }

    /// Process one inbound text frame.
    ///
    /// Frames over the rate ceiling and frames that fail to decode are
    /// dropped; neither closes the connection.
    pub fn handle_message(&mut self, state: &RelayState, raw: &str) {
        if !self.rate.check() {
            debug!(client = self.id, "rate limit exceeded, dropping message");
            return;
        }

        let msg = match decode_client(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client = self.id, error = %e, "dropping malformed message");
                return;
            }
        };

        match msg {
            ClientMessage::Sync { last_seq } => {
                if self.has_synced_once {
                    debug!(client = self.id, "ignoring repeated sync");
                    return;
                }
                self.has_synced_once = true;
                state.sync_client(self.id, last_seq);
            }
            ClientMessage::Input { data } => {
                state.write_input(data.as_bytes());
            }
            ClientMessage::Resize { cols, rows } => {
                let Some((cols, rows)) = valid_size(cols, rows) else {
                    debug!(client = self.id, cols, rows, "ignoring out-of-range resize");
                    return;
                };
                self.size = Some((cols, rows));
                state.set_client_size(self.id, cols, rows);
            }
            ClientMessage::ImageUpload { data, filename } => {
                let reply = match state.store_image(&data, filename.as_deref()) {
                    Ok(path) => {
                        info!(client = self.id, path = %path.display(), "image uploaded");
                        ServerMessage::uploaded(path.display().to_string())
                    }
                    Err(e) => {
                        warn!(client = self.id, error = %e, "image upload rejected");
                        ServerMessage::upload_failed(e.to_string())
                    }
                };
                state.send_to(self.id, reply);
            }
        }
    }
}

/// Accept a resize only when both dimensions are in range.
pub fn valid_size(cols: i64, rows: i64) -> Option<(u16, u16)> {
    if (1..=MAX_COLS).contains(&cols) && (1..=MAX_ROWS).contains(&rows) {
        Some((cols as u16, rows as u16))
    } else {
        None
    }
}

/// Drive one admitted WebSocket until either side goes away.
pub async fn serve_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (id, outbound_rx) = match state.register_client() {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(error = %e, "rejecting connection");
            websocket::ws_reject(socket, CLOSE_TOO_MANY_CONNECTIONS, "too many connections").await;
            return;
        }
    };

    let config = state.config();
    let session = ClientSession::new(
        id,
        MessageRateLimiter::new(config.msg_rate_limit, config.msg_rate_window),
    );
    session_loop(socket, &state, session, outbound_rx).await;
    state.unregister_client(id);
}

async fn session_loop(
    socket: WebSocket,
    state: &RelayState,
    mut session: ClientSession,
    mut outbound_rx: mpsc::Receiver<ServerMessage>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut shutdown_rx = state.subscribe_shutdown();
    let mut heartbeat = tokio::time::interval(state.config().heartbeat_interval);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(client = session.id, "relay shutting down, closing connection");
                drain_outbound(&mut sink, &mut outbound_rx).await;
                websocket::ws_close(&mut sink, CLOSE_GOING_AWAY, "session ended").await;
                break;
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = websocket::ws_send_message(&mut sink, &msg).await {
                            debug!(client = session.id, error = %e, "send failed, closing connection");
                            break;
                        }
                    }
                    None => {
                        // Relay dropped this client.
                        websocket::ws_close(&mut sink, CLOSE_GOING_AWAY, "dropped").await;
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = websocket::ws_send_ping(&mut sink).await {
                    debug!(client = session.id, error = %e, "heartbeat failed, closing connection");
                    break;
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => session.handle_message(state, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client = session.id, "peer closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = session.id, error = %e, "receive failed, closing connection");
                        break;
                    }
                }
            }
        }
    }
}

/// Flush whatever is already queued (typically the exit notice) before a
/// shutdown close.
async fn drain_outbound(sink: &mut WsSink, outbound_rx: &mut mpsc::Receiver<ServerMessage>) {
    while let Ok(msg) = outbound_rx.try_recv() {
        if websocket::ws_send_message(sink, &msg).await.is_err() {
            return;
        }
    }
}
