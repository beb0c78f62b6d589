//! Shared relay state.
//!
//! Owns the session token, the sequenced output log, the table of live
//! connections with their outbound queues, and the size arbiter. Log
//! append + fan-out and size recompute each run under one mutex, so every
//! connection observes chunks in log order and the PTY never sees a size
//! computed from a half-updated table.

use super::sizing::SizeArbiter;
use super::upload::{self, UploadError};
use crate::config::RelayConfig;
use crate::session::{OutputLog, OutputRecord, TerminalSink};
use rtty_core::{generate_token, RttyError, RttyResult, ServerMessage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub type ClientId = u64;

/// Outbound queue depth per connection. A client this far behind is dropped.
const OUTBOUND_QUEUE: usize = 256;

struct RelayInner {
    log: OutputLog,
    clients: HashMap<ClientId, mpsc::Sender<ServerMessage>>,
    sizes: SizeArbiter,
    exit_code: Option<i32>,
}

/// All mutable relay state, created once per session and reset at teardown.
pub struct RelayState {
    config: RelayConfig,
    sink: Arc<dyn TerminalSink>,
    inner: Mutex<RelayInner>,
    token: RwLock<Option<String>>,
    scratch_dir: Mutex<Option<PathBuf>>,
    next_client_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayState {
    /// Create relay state forwarding input and sizes to `sink`, starting from
    /// the local terminal's size.
    pub fn new(config: RelayConfig, sink: Arc<dyn TerminalSink>, local_size: (u16, u16)) -> Self {
        let log = OutputLog::new(config.log_high_water, config.log_low_water);
        Self {
            config,
            sink,
            inner: Mutex::new(RelayInner {
                log,
                clients: HashMap::new(),
                sizes: SizeArbiter::new(local_size.0, local_size.1),
                exit_code: None,
            }),
            token: RwLock::new(None),
            scratch_dir: Mutex::new(None),
            next_client_id: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start a session: mint the token every client must present.
    pub fn init(&self) -> String {
        let token = generate_token();
        *self.token.write().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        info!("session token generated");
        token
    }

    /// The live token, if a session is running.
    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// End the session: close every connection, forget the token, drop the
    /// log and size table, and remove the scratch directory.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.log.clear();
            inner.clients.clear();
            inner.sizes.clear_clients();
            inner.exit_code = None;
        }
        *self.token.write().unwrap_or_else(|p| p.into_inner()) = None;
        let _ = self.shutdown_tx.send(());

        let dir = self
            .scratch_dir
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(dir) = dir {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(path = %dir.display(), "scratch directory removed"),
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove scratch directory"),
            }
        }
        info!("relay state reset");
    }

    /// Notified when the relay is reset.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Admit a new connection, unless the connection ceiling is reached.
    pub fn register_client(&self) -> RttyResult<(ClientId, mpsc::Receiver<ServerMessage>)> {
        let mut inner = self.lock();
        if inner.clients.len() >= self.config.max_connections {
            return Err(RttyError::ResourceExhausted(format!(
                "connection limit ({}) reached",
                self.config.max_connections
            )));
        }
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        inner.clients.insert(id, tx);
        info!(client = id, connected = inner.clients.len(), "client connected");
        self.apply_size(&inner);
        Ok((id, rx))
    }

    /// Forget a connection and re-arbitrate the PTY size without it.
    pub fn unregister_client(&self, id: ClientId) {
        let mut inner = self.lock();
        if inner.clients.remove(&id).is_some() {
            info!(client = id, connected = inner.clients.len(), "client disconnected");
        }
        inner.sizes.remove_client(id);
        self.apply_size(&inner);
    }

    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Append a PTY chunk to the log and fan it out to every connection.
    pub fn handle_pty_output(&self, chunk: &str) {
        let mut inner = self.lock();
        let seq = inner.log.append(chunk);
        let msg = ServerMessage::Output {
            seq,
            data: chunk.to_string(),
        };
        self.broadcast_locked(&mut inner, msg);
    }

    /// Tell every connection the PTY exited. Only the first call broadcasts.
    pub fn handle_pty_exit(&self, code: i32) {
        let mut inner = self.lock();
        if inner.exit_code.is_some() {
            return;
        }
        inner.exit_code = Some(code);
        self.broadcast_locked(&mut inner, ServerMessage::Exit { code });
    }

    /// Answer a client's `sync` through its outbound queue.
    pub fn sync_client(&self, id: ClientId, last_seq: Option<u64>) {
        let mut inner = self.lock();
        if let Some(reply) = inner.log.sync_reply(last_seq) {
            self.send_locked(&mut inner, id, reply);
        }
    }

    /// Queue a reply for one connection.
    pub fn send_to(&self, id: ClientId, msg: ServerMessage) {
        let mut inner = self.lock();
        self.send_locked(&mut inner, id, msg);
    }

    /// Record a client's declared size and re-arbitrate.
    pub fn set_client_size(&self, id: ClientId, cols: u16, rows: u16) {
        let mut inner = self.lock();
        if !inner.clients.contains_key(&id) {
            return;
        }
        inner.sizes.set_client(id, cols, rows);
        self.apply_size(&inner);
    }

    /// Record the local terminal's size and re-arbitrate.
    pub fn set_local_size(&self, cols: u16, rows: u16) {
        let mut inner = self.lock();
        inner.sizes.set_local(cols, rows);
        self.apply_size(&inner);
    }

    /// The size the PTY should currently have.
    pub fn effective_size(&self) -> Option<(u16, u16)> {
        self.lock().sizes.effective()
    }

    /// Forward client keystrokes to the PTY.
    pub fn write_input(&self, data: &[u8]) {
        self.sink.write_input(data);
    }

    /// Decode and store an uploaded image, creating the scratch directory on
    /// first use.
    pub fn store_image(&self, data: &str, filename: Option<&str>) -> Result<PathBuf, UploadError> {
        let bytes = upload::decode_image(data, self.config.max_image_bytes)?;
        let mut scratch = self.scratch_dir.lock().unwrap_or_else(|p| p.into_inner());
        let dir = match scratch.as_ref() {
            Some(dir) => dir.clone(),
            None => {
                let dir = upload::create_scratch_dir()?;
                info!(path = %dir.display(), "scratch directory created");
                *scratch = Some(dir.clone());
                dir
            }
        };
        drop(scratch);
        upload::save_image(&dir, filename, &bytes)
    }

    /// Scratch directory, if an upload has created it.
    #[cfg(test)]
    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.scratch_dir
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The `limit` most recent log records and the newest sequence number.
    pub fn terminal_context(&self, limit: usize) -> (Vec<OutputRecord>, Option<u64>) {
        let inner = self.lock();
        (inner.log.recent(limit), inner.log.newest_seq())
    }

    fn apply_size(&self, inner: &RelayInner) {
        if let Some((cols, rows)) = inner.sizes.effective() {
            self.sink.apply_size(cols, rows);
        }
    }

    fn broadcast_locked(&self, inner: &mut RelayInner, msg: ServerMessage) {
        let mut failed = Vec::new();
        for (id, tx) in &inner.clients {
            if tx.try_send(msg.clone()).is_err() {
                failed.push(*id);
            }
        }
        self.drop_clients(inner, &failed);
    }

    fn send_locked(&self, inner: &mut RelayInner, id: ClientId, msg: ServerMessage) {
        let failed = match inner.clients.get(&id) {
            Some(tx) => tx.try_send(msg).is_err(),
            None => false,
        };
        if failed {
            self.drop_clients(inner, &[id]);
        }
    }

    /// Dropping a client's sender ends its connection task, which closes
    /// the socket.
    fn drop_clients(&self, inner: &mut RelayInner, ids: &[ClientId]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            warn!(client = id, "outbound queue full or closed, dropping client");
            inner.clients.remove(id);
            inner.sizes.remove_client(*id);
        }
        self.apply_size(inner);
    }
}
