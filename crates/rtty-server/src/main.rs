//! rtty: share one local terminal with browsers over a public tunnel.
//!
//! Spawns the command in a PTY, mirrors it locally, and relays it to
//! authenticated WebSocket clients reached through a tunnel URL.

mod auth;
mod config;
mod orchestrator;
mod relay;
mod session;
mod terminal;
mod transport;
mod tunnel;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use orchestrator::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// rtty: relay a terminal session to the browser
#[derive(Parser, Debug)]
#[command(name = "rtty", version, about = "Relay a local terminal session to the browser")]
struct Cli {
    /// Local port for the relay (0 picks a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.rtty/config.toml")]
    config: String,

    /// Serve on localhost only, without starting a tunnel
    #[arg(long)]
    no_tunnel: bool,

    /// Tunnel program to launch
    #[arg(long)]
    tunnel_bin: Option<String>,

    /// Directory holding the browser client (index.html and assets)
    #[arg(long)]
    web_root: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to run, with its arguments (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the mirrored terminal.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rtty");

    let mut command = cli.command.into_iter();
    let overrides = CliOverrides {
        port: cli.port,
        web_root: cli.web_root,
        tunnel_program: cli.tunnel_bin,
        no_tunnel: cli.no_tunnel,
        command: command.next(),
        args: command.collect(),
        cwd: cli.cwd,
    };

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(server_config));
    let code = orchestrator.run().await;

    info!(code, "rtty stopped");
    std::process::exit(code);
}
