#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termbridge
//!
//! Terminal session bridge: keeps shells alive on a PTY under a session key
//! and lets any number of browser tabs attach to them over WebSocket. In
//! remote mode the same endpoint relays to a termbridge on another host
//! through a SOCKS5 proxy.
//!
//! ## Subcommands
//!
//! - `termbridge serve` (default) - run the HTTP/WS server
//! - `termbridge probe` - dial the configured tunnel route once and report
//!
//! ## API surface
//!
//! | Method | Path                  | Auth     | Description                         |
//! |--------|-----------------------|----------|-------------------------------------|
//! | GET    | `/api/health`         | No       | Liveness, session count, dial stats |
//! | GET    | `/api/sessions`       | Yes      | List live sessions                  |
//! | DELETE | `/api/sessions/{key}` | Yes      | Kill a session                      |
//! | GET    | `/api/ws`             | `?token` | Terminal attachment                 |
//! | ANY    | `/editor/{*path}`     | Yes      | Editor reverse proxy                |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, sweep task, graceful shutdown
//! lib.rs           - router assembly
//! auth.rs          - Bearer / token validation, session key derivation
//! config.rs        - TOML + env-var configuration
//! protocol.rs      - JSON frames, close reasons, UTF-8 carry decoder
//! client.rs        - reconnect backoff and dead-link rules for clients
//! routes/
//!   health.rs      - GET /api/health
//!   sessions.rs    - GET /api/sessions, DELETE /api/sessions/{key}
//! shell/
//!   pty.rs         - PTY allocation, spawn, resize
//!   process.rs     - ShellProcess (input task, output stream, exit watch)
//! sessions/
//!   buffer.rs      - ReplayRing
//!   session.rs     - Session (fan-out, geometry, display mode, close)
//!   mod.rs         - SessionRegistry (get-or-create, attach, kill, sweep)
//! ws/
//!   mod.rs         - upgrade, attachment loop, writer task
//!   outbound.rs    - bounded per-attachment queues and kick switch
//!   heartbeat.rs   - probe / expiry bookkeeping
//!   attachment.rs  - attachment state machine
//! tunnel/
//!   dialer.rs      - direct and SOCKS5 dialing with classified failures
//!   relay.rs       - remote mode WebSocket relay
//!   http.rs        - editor HTTP proxy
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use termbridge::sessions::SweepEvent;
use termbridge::{build_router, AppState, Config};

/// Terminal session bridge.
#[derive(Parser)]
#[command(name = "termbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Dial the shell host route once and print the outcome.
    Probe {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Override the destination host.
        #[arg(long)]
        host: Option<String>,
        /// Override the destination port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Probe { config, host, port }) => {
            run_probe(config.as_deref(), host, port).await
        }
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
            ExitCode::SUCCESS
        }
        None => {
            run_server(None).await;
            ExitCode::SUCCESS
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_probe(config_path: Option<&str>, host: Option<String>, port: Option<u16>) -> ExitCode {
    let mut config = Config::load(config_path);
    init_tracing(&config);
    if let Some(host) = host {
        config.tunnel.host = host;
    }
    if let Some(port) = port {
        config.tunnel.port = port;
    }

    let route = config.tunnel.shell_host_route();
    let via = route.proxy.clone().unwrap_or_else(|| "direct".to_string());
    let state = AppState::new(config);
    match state.dialer.dial(&route).await {
        Ok(_stream) => {
            println!("ok {} via {via}", route.destination());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("failed {} via {via}: {} ({e})", route.destination(), e.class());
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("termbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.tunnel.remote {
        let route = config.tunnel.shell_host_route();
        info!(
            destination = %route.destination(),
            proxy = route.proxy.as_deref().unwrap_or("direct"),
            "Remote mode: relaying terminals"
        );
    }

    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set TERMBRIDGE_API_KEY or update config");
    }

    let sweep_interval = Duration::from_secs(config.session.sweep_interval_secs.max(1));
    let state = AppState::new(config);
    let app = build_router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: reap idle sessions and drop exited ones
    let registry = state.registry.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            for event in registry.sweep().await {
                match event {
                    SweepEvent::Expired(key) => info!(session = %key, "Swept idle session"),
                    SweepEvent::Exited(key) => info!(session = %key, "Swept exited session"),
                }
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    state.registry.kill_all().await;
    info!("Goodbye");
}
