#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! termbridge library: persistent PTY shells multiplexed over WebSocket.
//!
//! - `sessions` - keyed session registry, replay ring, fan-out
//! - `shell` - PTY allocation and shell process lifecycle
//! - `ws` - attachment handler, heartbeat, outbound queues
//! - `protocol` - JSON frames and close reasons
//! - `tunnel` - SOCKS5 dialer, remote relay, editor proxy
//! - `client` - reconnect contract shared with front ends
//! - `auth`, `config`, `routes`, `state`

pub mod auth;
pub mod client;
pub mod config;
pub mod protocol;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod tunnel;
pub mod util;
pub mod ws;

use axum::{
    middleware,
    routing::{any, delete, get},
    Extension, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use auth::ApiKey;
pub use config::Config;
pub use sessions::SessionRegistry;
pub use state::AppState;

/// Full HTTP/WS surface for `state`.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route("/api/sessions/{key}", delete(routes::sessions::kill_session))
        .route("/editor", any(tunnel::http::editor_proxy))
        .route("/editor/{*path}", any(tunnel::http::editor_proxy))
        .layer(middleware::from_fn(auth::require_api_key));

    // token travels in the query string; checked after the upgrade
    let ws_route = Router::new().route("/api/ws", get(ws::ws_upgrade));

    let max_connections = state.config.server.max_connections.max(1);
    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(state.api_key.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}
