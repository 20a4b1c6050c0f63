//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` - liveness probe.
///
/// Returns status, uptime, version, session count, and tunnel status with
/// dial counters per failure class. No authentication required, suitable
/// for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.registry.len().await;
    let tunnel = &state.config.tunnel;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "tunnel": {
            "remote": tunnel.remote,
            "destination": format!("{}:{}", tunnel.host, tunnel.port),
            "proxy": tunnel.proxy,
            "dials": state.dialer.stats().to_json(),
        },
        "editor": state.config.editor.is_some(),
    }))
}
