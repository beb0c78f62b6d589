//! Single-instance PTY supervisor.
//!
//! Owns at most one live PTY. Output is mirrored to the local terminal and
//! handed to every output subscriber in emission order, chunk for chunk;
//! exit subscribers hear the exit code exactly once per spawned process.

use super::pty::{PtyHandle, SpawnSpec, SpawnedPty, Utf8Decoder};
use rtty_core::{RttyError, RttyResult};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Read size for the blocking PTY reader thread.
const READ_CHUNK: usize = 8192;

/// How long output still trickling in after the child exits is forwarded
/// before the exit is announced.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// The operations the relay needs from the PTY side.
pub trait TerminalSink: Send + Sync {
    /// Forward input bytes; a no-op when nothing is running.
    fn write_input(&self, data: &[u8]);
    /// Apply an arbitrated size; a no-op when nothing is running.
    fn apply_size(&self, cols: u16, rows: u16);
}

#[derive(Default)]
struct Inner {
    handle: Option<PtyHandle>,
    /// Bumped per spawn so a stale pump can never clear a newer handle.
    generation: u64,
    output_subs: Vec<OutputCallback>,
    exit_subs: Vec<ExitCallback>,
}

/// Supervises the one PTY of this process.
pub struct PtySupervisor {
    inner: Arc<Mutex<Inner>>,
    mirror_local: bool,
}

impl PtySupervisor {
    /// `mirror_local` copies every output chunk to this process's stdout.
    pub fn new(mirror_local: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            mirror_local,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    /// Start `spec` in a new PTY. Fails if one is already live.
    pub fn spawn(&self, spec: &SpawnSpec, cols: u16, rows: u16) -> RttyResult<()> {
        let mut inner = self.lock();
        if inner.handle.is_some() {
            return Err(RttyError::Pty("a PTY is already running".into()));
        }

        let SpawnedPty {
            handle,
            reader,
            mut child,
        } = PtyHandle::spawn(spec, cols.max(1), rows.max(1))?;
        inner.handle = Some(handle);
        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<String>();
        std::thread::Builder::new()
            .name("rtty-pty-reader".into())
            .spawn(move || read_loop(reader, chunk_tx))
            .map_err(|e| RttyError::Pty(format!("failed to start PTY reader: {e}")))?;

        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    warn!(error = %e, "PTY wait failed");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        });

        tokio::spawn(pump(
            self.inner.clone(),
            generation,
            self.mirror_local,
            chunk_rx,
            exit_rx,
        ));

        Ok(())
    }

    /// Write bytes to the PTY. No-op if none is live.
    pub fn write(&self, data: &[u8]) -> RttyResult<()> {
        let inner = self.lock();
        match inner.handle.as_ref() {
            Some(handle) => handle.write_all(data),
            None => Ok(()),
        }
    }

    /// Resize the PTY. No-op if none is live, the size is degenerate, or it
    /// would not change anything.
    pub fn resize(&self, cols: u16, rows: u16) -> RttyResult<()> {
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        let mut inner = self.lock();
        match inner.handle.as_mut() {
            Some(handle) if handle.size() != (cols, rows) => handle.resize(cols, rows),
            _ => Ok(()),
        }
    }

    /// Register an output subscriber.
    pub fn on_output(&self, cb: OutputCallback) {
        self.lock().output_subs.push(cb);
    }

    /// Register an exit subscriber.
    pub fn on_exit(&self, cb: ExitCallback) {
        self.lock().exit_subs.push(cb);
    }

    /// Drop every output and exit subscriber.
    pub fn unsubscribe_all(&self) {
        let mut inner = self.lock();
        inner.output_subs.clear();
        inner.exit_subs.clear();
    }

    /// Send a kill to the live PTY process, if any. The handle is cleared by
    /// the exit path once the process is reaped.
    pub fn kill(&self) -> RttyResult<()> {
        let inner = self.lock();
        match inner.handle.as_ref() {
            Some(handle) => {
                info!("killing PTY process");
                handle.kill()
            }
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn is_alive(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Size of the live PTY.
    #[cfg(test)]
    pub fn size(&self) -> Option<(u16, u16)> {
        self.lock().handle.as_ref().map(|h| h.size())
    }
}

impl TerminalSink for PtySupervisor {
    fn write_input(&self, data: &[u8]) {
        if let Err(e) = self.write(data) {
            warn!(error = %e, "PTY write failed");
        }
    }

    fn apply_size(&self, cols: u16, rows: u16) {
        if let Err(e) = self.resize(cols, rows) {
            warn!(error = %e, "PTY resize failed");
        }
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // Subscriber lists stay consistent even if a holder panicked.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Blocking reader: PTY bytes → decoded text chunks.
fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && tx.send(text).is_err() {
                    break;
                }
            }
            Err(e) => {
                // EIO once the child side is gone.
                debug!(error = %e, "PTY reader stopped");
                break;
            }
        }
    }
}

/// Deliver chunks in order, then announce the exit exactly once.
async fn pump(
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    mirror_local: bool,
    mut chunks: mpsc::UnboundedReceiver<String>,
    mut exit_rx: oneshot::Receiver<i32>,
) {
    let deliver = |chunk: &str| {
        if mirror_local {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(chunk.as_bytes());
            let _ = stdout.flush();
        }
        let subs = lock_inner(&inner).output_subs.clone();
        for cb in &subs {
            cb(chunk);
        }
    };

    let code = loop {
        tokio::select! {
            biased;
            chunk = chunks.recv() => match chunk {
                Some(chunk) => deliver(&chunk),
                None => break (&mut exit_rx).await.unwrap_or(-1),
            },
            code = &mut exit_rx => {
                let code = code.unwrap_or(-1);
                while let Ok(Some(chunk)) = tokio::time::timeout(DRAIN_GRACE, chunks.recv()).await {
                    deliver(&chunk);
                }
                break code;
            }
        }
    };

    let subs = {
        let mut guard = lock_inner(&inner);
        if guard.generation != generation {
            return;
        }
        guard.handle = None;
        guard.exit_subs.clone()
    };
    info!(code, "PTY process exited");
    for cb in &subs {
        cb(code);
    }
}
