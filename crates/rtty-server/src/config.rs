//! Server configuration: TOML file + CLI overrides.

use rtty_core::{RttyError, RttyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
    #[serde(default)]
    pub web_root: Option<String>,
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,
    #[serde(default = "default_health_retry_ms")]
    pub health_retry_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            port_attempts: default_port_attempts(),
            web_root: None,
            health_retries: default_health_retries(),
            health_retry_ms: default_health_retry_ms(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_msg_rate_limit")]
    pub msg_rate_limit: u32,
    #[serde(default = "default_msg_rate_window_ms")]
    pub msg_rate_window_ms: u64,
    #[serde(default = "default_log_high_water")]
    pub log_high_water: usize,
    #[serde(default = "default_log_low_water")]
    pub log_low_water: usize,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_cookie_max_age_secs")]
    pub cookie_max_age_secs: u64,
    #[serde(default = "default_context_entries")]
    pub context_entries: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            msg_rate_limit: default_msg_rate_limit(),
            msg_rate_window_ms: default_msg_rate_window_ms(),
            log_high_water: default_log_high_water(),
            log_low_water: default_log_low_water(),
            max_image_bytes: default_max_image_bytes(),
            heartbeat_secs: default_heartbeat_secs(),
            cookie_max_age_secs: default_cookie_max_age_secs(),
            context_entries: default_context_entries(),
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tunnel_program")]
    pub program: String,
    #[serde(default = "default_tunnel_args")]
    pub args: Vec<String>,
    #[serde(default = "default_url_pattern")]
    pub url_pattern: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_tunnel_program(),
            args: default_tunnel_args(),
            url_pattern: default_url_pattern(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

fn default_port() -> u16 {
    7681
}
fn default_port_attempts() -> u16 {
    20
}
fn default_health_retries() -> u32 {
    20
}
fn default_health_retry_ms() -> u64 {
    100
}
fn default_max_connections() -> usize {
    10
}
fn default_msg_rate_limit() -> u32 {
    100
}
fn default_msg_rate_window_ms() -> u64 {
    1000
}
fn default_log_high_water() -> usize {
    5000
}
fn default_log_low_water() -> usize {
    4000
}
fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_cookie_max_age_secs() -> u64 {
    86400
}
fn default_context_entries() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_tunnel_program() -> String {
    "cloudflared".to_string()
}
fn default_tunnel_args() -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--no-autoupdate".to_string(),
        "--url".to_string(),
        "http://127.0.0.1:{port}".to_string(),
    ]
}
fn default_url_pattern() -> String {
    r"https://[a-z0-9-]+\.trycloudflare\.com".to_string()
}
fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_stop_grace_ms() -> u64 {
    3000
}

/// Limits and knobs of the relay protocol engine.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_connections: usize,
    pub msg_rate_limit: u32,
    pub msg_rate_window: Duration,
    pub log_high_water: usize,
    pub log_low_water: usize,
    pub max_image_bytes: usize,
    pub heartbeat_interval: Duration,
    pub cookie_max_age_secs: u64,
    pub context_entries: usize,
    /// Directory holding `index.html` and static assets.
    pub web_root: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_section(&RelaySection::default(), default_web_root())
    }
}

impl RelayConfig {
    fn from_section(section: &RelaySection, web_root: PathBuf) -> Self {
        // A low-water mark above the high-water mark would never trim.
        let log_low_water = section.log_low_water.min(section.log_high_water);
        Self {
            max_connections: section.max_connections,
            msg_rate_limit: section.msg_rate_limit,
            msg_rate_window: Duration::from_millis(section.msg_rate_window_ms),
            log_high_water: section.log_high_water,
            log_low_water,
            max_image_bytes: section.max_image_bytes,
            heartbeat_interval: Duration::from_secs(section.heartbeat_secs.max(1)),
            cookie_max_age_secs: section.cookie_max_age_secs,
            context_entries: section.context_entries,
            web_root,
        }
    }
}

/// How to launch the tunnel subprocess and recognize its public URL.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub program: String,
    /// Arguments; `{port}` is replaced with the relay's local port.
    pub args: Vec<String>,
    pub url_pattern: String,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::from_section(&TunnelSection::default())
    }
}

impl TunnelConfig {
    fn from_section(section: &TunnelSection) -> Self {
        Self {
            program: section.program.clone(),
            args: section.args.clone(),
            url_pattern: section.url_pattern.clone(),
            startup_timeout: Duration::from_secs(section.startup_timeout_secs),
            stop_grace: Duration::from_millis(section.stop_grace_ms),
        }
    }

    /// Arguments with `{port}` substituted.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{port}", &port.to_string()))
            .collect()
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// First port tried; `0` asks the OS for an ephemeral port.
    pub port: u16,
    pub port_attempts: u16,
    pub health_retries: u32,
    pub health_retry_interval: Duration,
    pub relay: RelayConfig,
    /// `None` when the tunnel step is disabled.
    pub tunnel: Option<TunnelConfig>,
    /// Command run inside the PTY.
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// CLI overrides, applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub web_root: Option<String>,
    pub tunnel_program: Option<String>,
    pub no_tunnel: bool,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RttyResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                Self::parse(&content)?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self::resolve(file_config, cli))
    }

    /// Parse the TOML config text.
    pub fn parse(content: &str) -> RttyResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RttyError::Other(format!("config parse error: {e}")))
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(file_config: ConfigFile, cli: CliOverrides) -> Self {
        let web_root = cli
            .web_root
            .or(file_config.server.web_root.clone())
            .map(|s| expand_tilde_str(&s))
            .unwrap_or_else(default_web_root);

        let tunnel = if cli.no_tunnel || !file_config.tunnel.enabled {
            None
        } else {
            let mut tunnel = TunnelConfig::from_section(&file_config.tunnel);
            if let Some(program) = cli.tunnel_program {
                tunnel.program = program;
            }
            Some(tunnel)
        };

        let command = cli.command.unwrap_or_else(default_shell);

        Self {
            port: cli.port.unwrap_or(file_config.server.port),
            port_attempts: file_config.server.port_attempts.max(1),
            health_retries: file_config.server.health_retries.max(1),
            health_retry_interval: Duration::from_millis(file_config.server.health_retry_ms),
            relay: RelayConfig::from_section(&file_config.relay, web_root),
            tunnel,
            command,
            args: cli.args,
            cwd: cli.cwd.map(|s| expand_tilde_str(&s)),
        }
    }
}

/// The user's login shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// `~/.rtty/web`, falling back to `./web`.
fn default_web_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".rtty").join("web"))
        .unwrap_or_else(|| PathBuf::from("web"))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let file = ServerConfig::parse("").unwrap();
        let cfg = ServerConfig::resolve(
            file,
            CliOverrides {
                command: Some("bash".into()),
                ..Default::default()
            },
        );
        assert_eq!(cfg.port, 7681);
        assert_eq!(cfg.relay.max_connections, 10);
        assert_eq!(cfg.relay.msg_rate_limit, 100);
        assert_eq!(cfg.relay.msg_rate_window, Duration::from_secs(1));
        assert_eq!(cfg.command, "bash");
        let tunnel = cfg.tunnel.expect("tunnel enabled by default");
        assert_eq!(tunnel.program, "cloudflared");
        assert_eq!(tunnel.startup_timeout, Duration::from_secs(30));
    }

    #[test]
    fn file_values_and_cli_overrides_merge() {
        let file = ServerConfig::parse(
            r#"
            [server]
            port = 9000

            [relay]
            max_connections = 3
            log_high_water = 10
            log_low_water = 50

            [tunnel]
            program = "my-tunnel"
            args = ["--port", "{port}"]
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(
            file,
            CliOverrides {
                port: Some(9100),
                tunnel_program: Some("other-tunnel".into()),
                ..Default::default()
            },
        );
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.relay.max_connections, 3);
        // Low water is clamped to high water.
        assert_eq!(cfg.relay.log_low_water, 10);
        let tunnel = cfg.tunnel.unwrap();
        assert_eq!(tunnel.program, "other-tunnel");
        assert_eq!(tunnel.args_for_port(9100), vec!["--port", "9100"]);
    }

    #[test]
    fn no_tunnel_flag_disables_tunnel() {
        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            CliOverrides {
                no_tunnel: true,
                ..Default::default()
            },
        );
        assert!(cfg.tunnel.is_none());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(ServerConfig::parse("[relay]\nmax_connections = \"many\"").is_err());
    }
}
