//! Session orchestrator.
//!
//! Startup order, each step gating the next: port selection, relay listener,
//! health probe, signal handlers, tunnel, PTY. Teardown runs at most once no
//! matter how many triggers race for it: kill PTY, reset and stop the relay,
//! stop the tunnel, restore the local terminal.

use crate::config::ServerConfig;
use crate::relay::{RelayServer, RelayState};
use crate::session::{PtySupervisor, SpawnSpec, TerminalSink};
use crate::terminal::{self, RawModeGuard};
use crate::tunnel::TunnelSupervisor;
use rtty_core::{RttyError, RttyResult};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-attempt timeout of the health probe.
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the session is ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    PtyExit(i32),
}

pub struct Orchestrator {
    config: ServerConfig,
    pty: Arc<PtySupervisor>,
    relay: Arc<RelayState>,
    tunnel: Option<Arc<TunnelSupervisor>>,
    server: tokio::sync::Mutex<Option<RelayServer>>,
    raw_mode: Mutex<Option<RawModeGuard>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cleaned_up: AtomicBool,
    interactive: bool,
}

impl Orchestrator {
    pub fn new(config: ServerConfig) -> Self {
        let interactive = terminal::stdin_is_tty();
        let pty = Arc::new(PtySupervisor::new(true));
        let sink: Arc<dyn TerminalSink> = pty.clone();
        let relay = Arc::new(RelayState::new(
            config.relay.clone(),
            sink,
            terminal::local_size(),
        ));
        let tunnel = config
            .tunnel
            .clone()
            .map(|t| Arc::new(TunnelSupervisor::new(t)));

        Self {
            config,
            pty,
            relay,
            tunnel,
            server: tokio::sync::Mutex::new(None),
            raw_mode: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            cleaned_up: AtomicBool::new(false),
            interactive,
        }
    }

    /// Override whether the local terminal takes part (raw-mode input and
    /// resize events). Detected from stdin by default.
    #[cfg(test)]
    pub fn local_terminal(mut self, enabled: bool) -> Self {
        self.interactive = enabled;
        self
    }

    /// Run the session to completion and return the process exit code.
    pub async fn run(self: Arc<Self>) -> i32 {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitReason>();

        let listener = match select_port(self.config.port, self.config.port_attempts).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "no usable port");
                return 1;
            }
        };

        let token = self.relay.init();
        let server = match RelayServer::start(listener, self.relay.clone()) {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "failed to start relay");
                self.cleanup().await;
                return 1;
            }
        };
        let port = server.port();
        *self.server.lock().await = Some(server);

        if let Err(e) = wait_for_health(
            port,
            self.config.health_retries,
            self.config.health_retry_interval,
        )
        .await
        {
            error!(error = %e, "relay failed its health check");
            self.cleanup().await;
            return 1;
        }

        // Installed before the tunnel and PTY so failures there still unwind.
        self.spawn_background(signal_task(exit_tx.clone()));

        let public_url = match &self.tunnel {
            Some(tunnel) => {
                tunnel.on_crash(Arc::new(|code| {
                    warn!(code, "tunnel crashed, continuing in local-only mode");
                }));
                let started = tokio::select! {
                    started = tunnel.start(port) => started,
                    reason = exit_rx.recv() => {
                        info!(?reason, "interrupted during tunnel startup");
                        self.cleanup().await;
                        return 0;
                    }
                };
                match started {
                    Ok(url) => url,
                    Err(e) => {
                        error!(error = %e, "tunnel failed to start");
                        self.cleanup().await;
                        return 1;
                    }
                }
            }
            None => format!("http://127.0.0.1:{port}"),
        };
        print_banner(&public_url, &token);

        if self.interactive {
            match RawModeGuard::enter() {
                Ok(guard) => {
                    *self.raw_mode.lock().unwrap_or_else(|p| p.into_inner()) = Some(guard);
                    terminal::forward_stdin(self.relay.clone());
                }
                Err(e) => warn!(error = %e, "local input disabled"),
            }
            if let Some(task) = terminal::watch_resize(self.relay.clone()) {
                self.spawn_background(task);
            }
        }

        if let Err(e) = self.spawn_pty(exit_tx) {
            error!(error = %e, "failed to start command");
            self.cleanup().await;
            return 1;
        }

        let reason = exit_rx.recv().await.unwrap_or(ExitReason::Signal);
        match reason {
            ExitReason::Signal => info!("received shutdown signal"),
            ExitReason::PtyExit(code) => info!(code, "command exited"),
        }
        self.cleanup().await;
        0
    }

    fn spawn_pty(&self, exit_tx: mpsc::UnboundedSender<ExitReason>) -> RttyResult<()> {
        let relay = self.relay.clone();
        self.pty
            .on_output(Arc::new(move |chunk| relay.handle_pty_output(chunk)));
        let relay = self.relay.clone();
        self.pty.on_exit(Arc::new(move |code| {
            relay.handle_pty_exit(code);
            let _ = exit_tx.send(ExitReason::PtyExit(code));
        }));

        let (cols, rows) = self
            .relay
            .effective_size()
            .unwrap_or(terminal::FALLBACK_SIZE);
        let spec = SpawnSpec {
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            cwd: self.config.cwd.clone(),
        };
        self.pty.spawn(&spec, cols, rows)
    }

    fn spawn_background(&self, task: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    /// Tear everything down. Only the first call does anything; it returns
    /// `true`, every later or concurrent call returns `false`.
    pub async fn cleanup(&self) -> bool {
        if self
            .cleaned_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        info!("shutting down");

        self.pty.unsubscribe_all();
        if let Err(e) = self.pty.kill() {
            warn!(error = %e, "failed to kill PTY");
        }

        self.relay.reset();
        if let Some(mut server) = self.server.lock().await.take() {
            server.stop().await;
        }

        if let Some(tunnel) = &self.tunnel {
            debug!(state = ?tunnel.state(), "stopping tunnel");
            tunnel.unsubscribe_all();
            tunnel.stop().await;
        }

        for task in self
            .background
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
        drop(self.raw_mode.lock().unwrap_or_else(|p| p.into_inner()).take());
        true
    }

    #[cfg(test)]
    pub fn relay(&self) -> &Arc<RelayState> {
        &self.relay
    }
}

/// Bind the first free port in `port..port + attempts` on loopback. Port 0
/// asks the OS for an ephemeral port.
pub async fn select_port(port: u16, attempts: u16) -> RttyResult<TcpListener> {
    if port == 0 {
        return TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(RttyError::from);
    }

    let mut last_err = None;
    for offset in 0..attempts.max(1) {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, candidate));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if offset > 0 {
                    info!(requested = port, port = candidate, "requested port busy, using next free one");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port = candidate, "port in use");
                last_err = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(RttyError::ResourceExhausted(format!(
        "no free port in {port}..{} ({})",
        port.saturating_add(attempts),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Poll the relay's health endpoint until it answers or retries run out.
pub async fn wait_for_health(port: u16, retries: u32, interval: Duration) -> RttyResult<()> {
    let client = reqwest::Client::builder()
        .timeout(HEALTH_REQUEST_TIMEOUT)
        .no_proxy()
        .build()
        .map_err(|e| RttyError::Transport(format!("cannot build HTTP client: {e}")))?;
    let url = format!("http://127.0.0.1:{port}/api/health");

    for attempt in 1..=retries.max(1) {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(attempt, "relay healthy");
                return Ok(());
            }
            Ok(resp) => debug!(attempt, status = %resp.status(), "relay not healthy yet"),
            Err(e) => debug!(attempt, error = %e, "relay not reachable yet"),
        }
        tokio::time::sleep(interval).await;
    }
    Err(RttyError::Timeout)
}

fn signal_task(exit_tx: mpsc::UnboundedSender<ExitReason>) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = exit_tx.send(ExitReason::Signal);
    })
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn print_banner(url: &str, token: &str) {
    let base = url.trim_end_matches('/');
    eprintln!();
    eprintln!("  rtty session ready");
    eprintln!("  open: {base}/?token={token}");
    eprintln!();
}
