//! Pre-shared API key authentication.
//!
//! REST endpoints except `/api/health` require an `Authorization: Bearer <key>`
//! header. The WebSocket path uses a `?token=` query parameter instead
//! (browsers can't set headers on WebSocket upgrades) and reports failure as
//! an `auth` close rather than an HTTP status.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Identity behind a valid credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Principal for holders of the pre-shared key.
pub const OPERATOR: &str = "operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential")]
    Invalid,
}

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized` - header missing or malformed
/// - `403 Forbidden` - key present but invalid
/// - `500 Internal Server Error` - [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(api_key) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match api_key.validate(provided) {
        Ok(_) => next.run(request).await,
        Err(AuthError::Missing) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response(),
        Err(AuthError::Invalid) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response(),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// The expected API key. Injected as a router extension for
/// [`require_api_key`] and used directly by the WebSocket handler.
#[derive(Clone)]
pub struct ApiKey(pub String);

impl ApiKey {
    /// Validate a presented credential: principal or rejection.
    pub fn validate(&self, provided: Option<&str>) -> Result<Principal, AuthError> {
        let provided = provided.filter(|p| !p.is_empty()).ok_or(AuthError::Missing)?;
        if constant_time_eq(self.0.as_bytes(), provided.as_bytes()) {
            Ok(Principal(OPERATOR.to_string()))
        } else {
            Err(AuthError::Invalid)
        }
    }
}

/// Stable session key for a principal/client pair: `c-` + 16 hex chars of
/// SHA-256. Lets a device reconnect to its own shell without naming it.
pub fn derive_session_key(principal: &Principal, client: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal.0.as_bytes());
    hasher.update(b"\0");
    hasher.update(client.as_bytes());
    let digest = hasher.finalize();
    format!("c-{}", &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b"sec"));
    }

    #[test]
    fn validate_distinguishes_missing_and_invalid() {
        let key = ApiKey("k3y".into());
        assert_eq!(key.validate(Some("k3y")), Ok(Principal(OPERATOR.into())));
        assert_eq!(key.validate(Some("nope")), Err(AuthError::Invalid));
        assert_eq!(key.validate(Some("")), Err(AuthError::Missing));
        assert_eq!(key.validate(None), Err(AuthError::Missing));
    }

    #[test]
    fn derived_keys_are_stable_and_distinct() {
        let p = Principal(OPERATOR.into());
        let a = derive_session_key(&p, "phone");
        assert_eq!(a, derive_session_key(&p, "phone"));
        assert_ne!(a, derive_session_key(&p, "laptop"));
        assert!(a.starts_with("c-"));
        assert_eq!(a.len(), 18);
        assert!(crate::sessions::validate_session_key(&a));
    }
}
