//! Tunnel supervisor.
//!
//! Launches the tunnel program, scans its stdout and stderr for the first
//! public URL, and watches it afterwards. State machine:
//!
//! ```text
//! Idle -> Starting -> Established(url) -> Stopped
//!            |               `----------> Crashed(code)
//!            `-> Stopped (startup failed)
//! ```
//!
//! An exit during `Starting` is reported through `start`'s error only. An
//! exit after `Established` fires the crash callbacks once, unless `stop`
//! asked for it.

use crate::config::TunnelConfig;
use regex::Regex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Proxy variables stripped from the tunnel's environment so it talks to
/// the local relay directly.
const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

/// Grace period for the child to be reaped after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TunnelState {
    #[default]
    Idle,
    Starting,
    Established(String),
    Stopped,
    Crashed(Option<i32>),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to launch tunnel: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tunnel did not publish a URL within {0:?}")]
    Timeout(Duration),

    #[error("tunnel exited before publishing a URL (exit code {0:?})")]
    ExitedBeforeReady(Option<i32>),

    #[error("tunnel already running")]
    AlreadyRunning,

    #[error("invalid tunnel URL pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type CrashCallback = Arc<dyn Fn(Option<i32>) + Send + Sync>;

#[derive(Default)]
struct Shared {
    state: Mutex<TunnelState>,
    crash_subs: Mutex<Vec<CrashCallback>>,
    intentional_stop: AtomicBool,
    crash_reported: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Runs once per tunnel process, whenever it exits.
    fn handle_exit(&self, code: Option<i32>) {
        let mut state = self.state();
        let prior = std::mem::replace(&mut *state, TunnelState::Stopped);

        if self.intentional_stop.load(Ordering::SeqCst) {
            info!(code, "tunnel stopped");
            return;
        }

        match prior {
            TunnelState::Established(url) => {
                *state = TunnelState::Crashed(code);
                drop(state);
                warn!(code, url = %url, "tunnel exited unexpectedly");
                if self.crash_reported.swap(true, Ordering::SeqCst) {
                    return;
                }
                let subs: Vec<CrashCallback> = self
                    .crash_subs
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                for cb in subs {
                    cb(code);
                }
            }
            TunnelState::Starting => {
                debug!(code, "tunnel exited during startup");
            }
            _ => {}
        }
    }
}

/// Handles to a live tunnel process.
struct Running {
    term_tx: Option<oneshot::Sender<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: watch::Receiver<bool>,
    monitor: JoinHandle<()>,
}

impl Running {
    /// Ask the monitor to SIGTERM the child. Returns `false` once the child
    /// has been reaped, so a recycled PID is never signalled.
    fn terminate(&mut self) -> bool {
        match self.term_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// SIGKILL the child and wait for the monitor to reap it.
    async fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(REAP_TIMEOUT, &mut self.monitor)
            .await
            .is_err()
        {
            warn!("tunnel process was not reaped in time");
            self.monitor.abort();
        }
    }
}

pub struct TunnelSupervisor {
    config: TunnelConfig,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Launch the tunnel towards `port` and wait for its public URL.
    pub async fn start(&self, port: u16) -> Result<String, TunnelError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(TunnelError::AlreadyRunning);
        }
        let pattern = Regex::new(&self.config.url_pattern)?;

        self.shared.intentional_stop.store(false, Ordering::SeqCst);
        self.shared.crash_reported.store(false, Ordering::SeqCst);
        *self.shared.state() = TunnelState::Starting;

        let args = self.config.args_for_port(port);
        info!(program = %self.config.program, args = ?args, "starting tunnel");

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in PROXY_VARS {
            cmd.env_remove(var);
        }
        cmd.env("NO_PROXY", "localhost,127.0.0.1")
            .env("no_proxy", "localhost,127.0.0.1");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.shared.state() = TunnelState::Idle;
                return Err(TunnelError::Spawn(e));
            }
        };

        let (url_tx, mut url_rx) = mpsc::channel::<String>(2);
        if let Some(stdout) = child.stdout.take() {
            scan_for_url(stdout, "stdout", pattern.clone(), url_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            scan_for_url(stderr, "stderr", pattern, url_tx);
        }

        let (term_tx, term_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (code_tx, mut code_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            child,
            term_rx,
            kill_rx,
            exited_tx,
            code_tx,
            self.shared.clone(),
        ));
        let mut handle = Running {
            term_tx: Some(term_tx),
            kill_tx: Some(kill_tx),
            exited_rx,
            monitor,
        };

        let outcome = tokio::time::timeout(self.config.startup_timeout, async {
            tokio::select! {
                Some(url) = url_rx.recv() => Ok(url),
                code = &mut code_rx => Err(code.ok().flatten()),
            }
        })
        .await;

        match outcome {
            Ok(Ok(url)) => {
                let mut state = self.shared.state();
                if *state != TunnelState::Starting {
                    // Exited between printing the URL and us seeing it.
                    drop(state);
                    let code = code_rx.try_recv().ok().flatten();
                    return Err(TunnelError::ExitedBeforeReady(code));
                }
                *state = TunnelState::Established(url.clone());
                drop(state);
                info!(url = %url, "tunnel established");
                *running = Some(handle);
                Ok(url)
            }
            Ok(Err(code)) => {
                warn!(code, "tunnel exited during startup");
                Err(TunnelError::ExitedBeforeReady(code))
            }
            Err(_) => {
                warn!(timeout = ?self.config.startup_timeout, "tunnel startup timed out");
                self.shared.intentional_stop.store(true, Ordering::SeqCst);
                handle.kill().await;
                *self.shared.state() = TunnelState::Stopped;
                Err(TunnelError::Timeout(self.config.startup_timeout))
            }
        }
    }

    /// Stop the tunnel: SIGTERM, then SIGKILL after the grace period.
    /// Never fires crash callbacks. Safe to call when nothing is running.
    pub async fn stop(&self) {
        let Some(mut handle) = self.running.lock().await.take() else {
            return;
        };
        self.shared.intentional_stop.store(true, Ordering::SeqCst);

        if !handle.terminate() {
            debug!("tunnel already exited");
        }

        let graceful = tokio::time::timeout(
            self.config.stop_grace,
            handle.exited_rx.wait_for(|exited| *exited),
        )
        .await
        .is_ok();
        if !graceful {
            warn!("tunnel ignored SIGTERM, killing");
        }
        handle.kill().await;
        *self.shared.state() = TunnelState::Stopped;
    }

    /// Register a callback for unexpected exits after establishment.
    pub fn on_crash(&self, cb: CrashCallback) {
        self.shared
            .crash_subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cb);
    }

    pub fn unsubscribe_all(&self) {
        self.shared
            .crash_subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state().clone()
    }

    /// The public URL while established.
    #[cfg(test)]
    pub fn url(&self) -> Option<String> {
        match self.state() {
            TunnelState::Established(url) => Some(url),
            _ => None,
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM to tunnel failed");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Own the child until it exits, then report the exit everywhere.
async fn monitor(
    mut child: Child,
    mut term_rx: oneshot::Receiver<()>,
    mut kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    code_tx: oneshot::Sender<Option<i32>>,
    shared: Arc<Shared>,
) {
    let mut term_pending = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            requested = &mut term_rx, if term_pending => {
                term_pending = false;
                // `id` is None once the child has been reaped.
                if let (Ok(()), Some(pid)) = (requested, child.id()) {
                    terminate(pid);
                }
            }
            _ = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "tunnel kill failed");
                }
                break child.wait().await;
            }
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "failed to wait for tunnel");
            None
        }
    };
    let _ = exited_tx.send(true);
    shared.handle_exit(code);
    let _ = code_tx.send(code);
}

/// Log every line of `reader` and forward the first URL match.
fn scan_for_url<R>(reader: R, stream: &'static str, pattern: Regex, url_tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut found = false;
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream, line = %line, "tunnel output");
            if found {
                continue;
            }
            if let Some(m) = pattern.find(&line) {
                found = true;
                let _ = url_tx.send(m.as_str().to_string()).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const URL: &str = "https://quiet-river-42.trycloudflare.com";

    fn script_config(script: &str) -> TunnelConfig {
        TunnelConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            ..TunnelConfig::default()
        }
    }

    fn crash_counter(tunnel: &TunnelSupervisor) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        tunnel.on_crash(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[tokio::test]
    async fn url_is_found_on_stderr_and_stop_is_quiet() {
        let tunnel = TunnelSupervisor::new(script_config(&format!(
            "echo 'starting' ; echo 'INF |  {URL}  |' >&2 ; sleep 30"
        )));
        let crashes = crash_counter(&tunnel);
        assert_eq!(tunnel.state(), TunnelState::Idle);

        let url = tunnel.start(8080).await.unwrap();
        assert_eq!(url, URL);
        assert_eq!(tunnel.url().as_deref(), Some(URL));

        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(crashes.load(Ordering::SeqCst), 0);
        // A second stop is a no-op.
        tunnel.stop().await;
    }

    #[tokio::test]
    async fn port_placeholder_is_substituted() {
        let mut config = script_config("echo \"https://port-$0.trycloudflare.com\" ; sleep 30");
        config.args.push("{port}".into());
        let tunnel = TunnelSupervisor::new(config);
        let url = tunnel.start(4321).await.unwrap();
        assert_eq!(url, "https://port-4321.trycloudflare.com");
        tunnel.stop().await;
    }

    #[tokio::test]
    async fn exit_before_url_is_a_startup_error() {
        let tunnel = TunnelSupervisor::new(script_config("echo nothing here ; exit 3"));
        let crashes = crash_counter(&tunnel);
        match tunnel.start(8080).await {
            Err(TunnelError::ExitedBeforeReady(code)) => assert_eq!(code, Some(3)),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(crashes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn startup_times_out_and_kills_child() {
        let mut config = script_config("sleep 30");
        config.startup_timeout = Duration::from_millis(200);
        let tunnel = TunnelSupervisor::new(config);
        let crashes = crash_counter(&tunnel);
        assert!(matches!(
            tunnel.start(8080).await,
            Err(TunnelError::Timeout(_))
        ));
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(crashes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let config = TunnelConfig {
            program: "/nonexistent/rtty-tunnel".into(),
            ..TunnelConfig::default()
        };
        let tunnel = TunnelSupervisor::new(config);
        assert!(matches!(
            tunnel.start(8080).await,
            Err(TunnelError::Spawn(_))
        ));
        assert_eq!(tunnel.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn crash_after_established_fires_callback_once() {
        let tunnel = TunnelSupervisor::new(script_config(&format!(
            "echo {URL} ; sleep 0.3 ; exit 7"
        )));
        let (tx, mut rx) = mpsc::unbounded_channel();
        tunnel.on_crash(Arc::new(move |code| {
            let _ = tx.send(code);
        }));

        tunnel.start(8080).await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(code, Some(Some(7)));
        assert_eq!(tunnel.state(), TunnelState::Crashed(Some(7)));
        assert!(rx.try_recv().is_err());

        // stop after a crash still tears down cleanly
        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn reaped_tunnel_is_never_signalled() {
        let tunnel = TunnelSupervisor::new(script_config(&format!(
            "echo {URL} ; sleep 0.2 ; exit 5"
        )));
        tunnel.start(8080).await.unwrap();

        for _ in 0..100 {
            let finished = tunnel
                .running
                .lock()
                .await
                .as_ref()
                .is_some_and(|r| r.monitor.is_finished());
            if finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(tunnel.state(), TunnelState::Crashed(Some(5)));

        let mut running = tunnel.running.lock().await;
        let handle = running.as_mut().unwrap();
        assert!(*handle.exited_rx.borrow());
        assert!(!handle.terminate());
        drop(running);

        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let tunnel = TunnelSupervisor::new(script_config(&format!("echo {URL} ; sleep 30")));
        tunnel.start(8080).await.unwrap();
        assert!(matches!(
            tunnel.start(8080).await,
            Err(TunnelError::AlreadyRunning)
        ));
        tunnel.stop().await;
    }

    #[tokio::test]
    async fn stop_escalates_when_sigterm_is_ignored() {
        let mut config = script_config(&format!("trap '' TERM ; echo {URL} ; while true ; do sleep 0.1 ; done"));
        config.stop_grace = Duration::from_millis(200);
        let tunnel = TunnelSupervisor::new(config);
        let crashes = crash_counter(&tunnel);
        tunnel.start(8080).await.unwrap();

        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(crashes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribed_callbacks_do_not_fire() {
        let tunnel = TunnelSupervisor::new(script_config(&format!(
            "echo {URL} ; sleep 0.2 ; exit 1"
        )));
        let crashes = crash_counter(&tunnel);
        tunnel.unsubscribe_all();
        tunnel.start(8080).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(tunnel.state(), TunnelState::Crashed(Some(1)));
        assert_eq!(crashes.load(Ordering::SeqCst), 0);
    }
}
