//! REST endpoints for session management.
//!
//! - `GET    /api/sessions`       - list all sessions
//! - `DELETE /api/sessions/{key}` - kill a session (attachments get `killed`)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/sessions` - list live sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.registry.list().await;
    Json(json!({
        "sessions": sessions,
    }))
}

/// `DELETE /api/sessions/{key}` - terminate a session regardless of attached
/// clients.
pub async fn kill_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.registry.kill(&key).await {
        Ok(Json(json!({
            "ok": true,
            "session": key,
        })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Session {key} not found"), "code": "SESSION_NOT_FOUND"})),
        ))
    }
}
