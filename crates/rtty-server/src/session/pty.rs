//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a given command, providing blocking
//! write and resize operations plus the raw reader and child handles for
//! the supervisor's pump.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use rtty_core::{RttyError, RttyResult};
use std::io::{Read, Write};
use std::sync::Mutex;
use tracing::{debug, info};

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
}

/// A live PTY: the master side plus a way to kill the child.
pub struct PtyHandle {
    writer: Mutex<Box<dyn Write + Send>>,
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    cols: u16,
    rows: u16,
}

/// Everything `spawn` hands back: the handle kept by the supervisor, and the
/// reader and child moved into the pump.
pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Spawn `spec` attached to a new PTY of the given size.
    pub fn spawn(spec: &SpawnSpec, cols: u16, rows: u16) -> RttyResult<SpawnedPty> {
        if spec.command.trim().is_empty() {
            return Err(RttyError::Pty("empty command".into()));
        }

        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| RttyError::Pty(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RttyError::Pty(format!("failed to spawn {}: {e}", spec.command)))?;
        // The reader only sees EOF once every slave fd is closed.
        drop(pair.slave);

        info!(command = %spec.command, cols, rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RttyError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RttyError::Pty(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        Ok(SpawnedPty {
            handle: Self {
                writer: Mutex::new(writer),
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                cols,
                rows,
            },
            reader,
            child,
        })
    }

    /// Write to the PTY input.
    pub fn write_all(&self, data: &[u8]) -> RttyResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RttyError::Pty("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&mut self, cols: u16, rows: u16) -> RttyResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| RttyError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| RttyError::Pty(format!("PTY resize failed: {e}")))?;
        drop(master);
        self.cols = cols;
        self.rows = rows;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Kill the child process.
    pub fn kill(&self) -> RttyResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| RttyError::Pty("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| RttyError::Pty(format!("kill failed: {e}")))
    }

    /// Current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

/// Incremental UTF-8 decoder for PTY output.
///
/// A multi-byte character split across two reads is held back until its
/// remaining bytes arrive; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + bytes` as forms complete characters.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete trailing sequence: wait for more.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }
}
