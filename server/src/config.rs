//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `TERMBRIDGE_API_KEY`, `TERMBRIDGE_LISTEN`,
//!    `TERMBRIDGE_REMOTE`, `TERMBRIDGE_PROXY`, `TERMBRIDGE_REMOTE_HOST`,
//!    `TERMBRIDGE_REMOTE_PORT`, `TERMBRIDGE_DIAL_TIMEOUT_MS`
//! 2. **Config file** - path via `--config <path>`, or `termbridge.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:7681"
//! max_connections = 64
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [shell]
//! command = "/bin/bash"
//! args = ["-l"]
//! default_working_dir = "~"
//!
//! [session]
//! max_sessions = 20
//! buffer_bytes = 51200          # 50 KB replay buffer per session
//! idle_timeout_secs = 1800      # reap detached sessions after 30 min
//! sweep_interval_secs = 120
//! outbound_queue = 256          # per-attachment queue before it is dropped
//!
//! [heartbeat]
//! interval_secs = 15
//! grace_secs = 30
//!
//! # Remote mode: relay terminals to the shell host through a SOCKS5 proxy
//! [tunnel]
//! remote = false
//! proxy = "127.0.0.1:1055"
//! host = "devbox"
//! port = 7681
//! dial_timeout_ms = 10000
//!
//! [editor]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::tunnel::{RetryPolicy, TunnelRoute};

/// Pause before the second editor dial attempt.
const EDITOR_RETRY_BACKOFF_MS: u64 = 250;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Optional editor upstream; omit to disable `/editor/*`.
    pub editor: Option<EditorConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:7681`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrently served HTTP/WS connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Default terminal rows when the client does not send any (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Default terminal columns when the client does not send any (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token. Override with `TERMBRIDGE_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// What to spawn for each session.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Program to run on the PTY (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub command: String,
    /// Arguments passed to `command` (default `["-l"]`, a login shell).
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
    /// Working directory when the client does not supply one (default `~`).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
    /// Directory holding per-session display-mode control files.
    /// Defaults to `$TMPDIR/termbridge`.
    pub runtime_dir: Option<String>,
}

/// Session registry limits and timers.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum live sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Replay buffer capacity in bytes per session (default 50 KB).
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
    /// Seconds a session may sit with zero attachments before it is reaped
    /// (default 1800).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between registry sweeps (default 120).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-attachment outbound queue depth (default 256 messages).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Server-side liveness probing.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between server probes (default 15).
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Seconds of total silence after which an attachment is closed (default 30).
    #[serde(default = "default_heartbeat_grace")]
    pub grace_secs: u64,
}

/// Remote-mode routing to the shell host.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Relay terminals to `host:port` instead of spawning locally (default false).
    #[serde(default)]
    pub remote: bool,
    /// SOCKS5 endpoint exposed by the overlay-network client (e.g. `127.0.0.1:1055`).
    /// Absent means the shell host is dialed directly.
    pub proxy: Option<String>,
    /// Shell host running its own termbridge (default `127.0.0.1`).
    #[serde(default = "default_remote_host")]
    pub host: String,
    /// Port of the remote termbridge (default 7681).
    #[serde(default = "default_remote_port")]
    pub port: u16,
    /// Token presented to the remote termbridge. Falls back to `auth.api_key`.
    pub remote_token: Option<String>,
    /// Bound on proxy connect + SOCKS5 handshake + destination connect (default 10 000).
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

/// Code-editor upstream proxied at `/editor/*`.
#[derive(Debug, Clone, Deserialize)]
pub struct EditorConfig {
    pub host: String,
    pub port: u16,
    /// Route through `tunnel.proxy` when remote mode is on (default true).
    #[serde(default = "default_true")]
    pub via_tunnel: bool,
    /// Dial attempts per request (default 2).
    #[serde(default = "default_editor_attempts")]
    pub max_attempts: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:7681".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_shell_args() -> Vec<String> {
    vec!["-l".to_string()]
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_max_sessions() -> usize {
    20
}
fn default_buffer_bytes() -> usize {
    50 * 1024
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    120
}
fn default_outbound_queue() -> usize {
    256
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_heartbeat_grace() -> u64 {
    30
}
fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}
fn default_remote_port() -> u16 {
    7681
}
fn default_dial_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_editor_attempts() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: default_shell_args(),
            default_working_dir: default_working_dir(),
            runtime_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            buffer_bytes: default_buffer_bytes(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            grace_secs: default_heartbeat_grace(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote: false,
            proxy: None,
            host: default_remote_host(),
            port: default_remote_port(),
            remote_token: None,
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            shell: ShellConfig::default(),
            session: SessionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            tunnel: TunnelConfig::default(),
            editor: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Route to the remote termbridge. Direct when no proxy is configured.
    pub fn shell_host_route(&self) -> TunnelRoute {
        TunnelRoute {
            host: self.host.clone(),
            port: self.port,
            proxy: self.proxy.clone(),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            retry: RetryPolicy::none(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `termbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("termbridge.toml").exists() {
            let content =
                std::fs::read_to_string("termbridge.toml").expect("Failed to read termbridge.toml");
            toml::from_str(&content).expect("Failed to parse termbridge.toml")
        } else {
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Apply environment overrides. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TERMBRIDGE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = lookup("TERMBRIDGE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(remote) = lookup("TERMBRIDGE_REMOTE") {
            self.tunnel.remote = matches!(remote.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(proxy) = lookup("TERMBRIDGE_PROXY") {
            self.tunnel.proxy = if proxy.is_empty() { None } else { Some(proxy) };
        }
        if let Some(host) = lookup("TERMBRIDGE_REMOTE_HOST") {
            self.tunnel.host = host;
        }
        if let Some(port) = lookup("TERMBRIDGE_REMOTE_PORT").and_then(|p| p.parse().ok()) {
            self.tunnel.port = port;
        }
        if let Some(ms) = lookup("TERMBRIDGE_DIAL_TIMEOUT_MS").and_then(|p| p.parse().ok()) {
            self.tunnel.dial_timeout_ms = ms;
        }
    }

    /// Route to the editor service, or `None` when `[editor]` is absent.
    /// Goes through the tunnel proxy only in remote mode with `via_tunnel`.
    pub fn editor_route(&self) -> Option<TunnelRoute> {
        let editor = self.editor.as_ref()?;
        let mut route = TunnelRoute::direct(
            editor.host.clone(),
            editor.port,
            Duration::from_millis(self.tunnel.dial_timeout_ms),
        )
        .with_retry(RetryPolicy::attempts(
            editor.max_attempts,
            Duration::from_millis(EDITOR_RETRY_BACKOFF_MS),
        ));
        if self.tunnel.remote && editor.via_tunnel {
            if let Some(ref proxy) = self.tunnel.proxy {
                route = route.via(proxy.clone());
            }
        }
        Some(route)
    }

    /// Token used when relaying to the remote termbridge.
    pub fn remote_token(&self) -> &str {
        self.tunnel
            .remote_token
            .as_deref()
            .unwrap_or(&self.auth.api_key)
    }

    /// Directory for display-mode control files.
    pub fn runtime_dir(&self) -> std::path::PathBuf {
        self.shell.runtime_dir.as_ref().map_or_else(
            || std::env::temp_dir().join("termbridge"),
            std::path::PathBuf::from,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7681");
        assert_eq!(config.session.buffer_bytes, 50 * 1024);
        assert_eq!(config.heartbeat.interval_secs, 15);
        assert!(!config.tunnel.remote);
        assert!(config.tunnel.proxy.is_none());
        assert!(config.editor.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            remote = true
            proxy = "127.0.0.1:1055"
            host = "devbox"

            [editor]
            host = "127.0.0.1"
            port = 8080
            "#,
        )
        .unwrap();
        assert!(config.tunnel.remote);
        assert_eq!(config.tunnel.port, 7681);
        assert_eq!(config.tunnel.dial_timeout_ms, 10_000);
        let editor = config.editor.unwrap();
        assert!(editor.via_tunnel);
        assert_eq!(editor.max_attempts, 2);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config.apply_env(|name| match name {
            "TERMBRIDGE_REMOTE" => Some("true".into()),
            "TERMBRIDGE_PROXY" => Some("10.0.0.1:1080".into()),
            "TERMBRIDGE_REMOTE_PORT" => Some("9000".into()),
            "TERMBRIDGE_DIAL_TIMEOUT_MS" => Some("not-a-number".into()),
            _ => None,
        });
        assert!(config.tunnel.remote);
        assert_eq!(config.tunnel.proxy.as_deref(), Some("10.0.0.1:1080"));
        assert_eq!(config.tunnel.port, 9000);
        assert_eq!(config.tunnel.dial_timeout_ms, 10_000);
    }

    #[test]
    fn empty_proxy_env_means_direct() {
        let mut config = Config::default();
        config.tunnel.proxy = Some("127.0.0.1:1055".into());
        config.apply_env(|name| (name == "TERMBRIDGE_PROXY").then(String::new));
        assert!(config.tunnel.proxy.is_none());
        assert!(config.tunnel.shell_host_route().proxy.is_none());
    }

    #[test]
    fn editor_route_uses_proxy_only_in_remote_mode() {
        let mut config: Config = toml::from_str(
            r#"
            [tunnel]
            proxy = "127.0.0.1:1055"

            [editor]
            host = "devbox"
            port = 8080
            max_attempts = 3
            "#,
        )
        .unwrap();
        let local = config.editor_route().unwrap();
        assert!(local.proxy.is_none());
        assert_eq!(local.retry.max_attempts, 3);

        config.tunnel.remote = true;
        let remote = config.editor_route().unwrap();
        assert_eq!(remote.proxy.as_deref(), Some("127.0.0.1:1055"));
        assert_eq!(remote.destination(), "devbox:8080");

        config.editor = None;
        assert!(config.editor_route().is_none());
    }

    #[test]
    fn remote_token_falls_back_to_api_key() {
        let mut config = Config::default();
        config.auth.api_key = "local".into();
        assert_eq!(config.remote_token(), "local");
        config.tunnel.remote_token = Some("upstream".into());
        assert_eq!(config.remote_token(), "upstream");
    }
}
