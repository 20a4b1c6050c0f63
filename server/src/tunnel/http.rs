//! Editor proxy: `/editor/{*path}` forwarded over a dialed stream.
//!
//! Each request dials the editor route (through the SOCKS5 proxy in remote
//! mode), runs one HTTP/1 client connection over it and streams the response
//! back. Upgrade requests (the editor's WebSocket channels) are spliced with
//! `copy_bidirectional` once both sides have switched protocols.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    Json,
};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::copy_bidirectional;
use tracing::{debug, info, warn};

use super::{DialError, TunnelRoute};
use crate::AppState;

/// Mount point stripped from forwarded paths.
const PREFIX: &str = "/editor";

/// Hop-by-hop headers per RFC 7230, never forwarded.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({"error": code, "message": message}))).into_response()
}

fn dial_failure(err: &DialError) -> Response {
    let status = if err.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    };
    error_response(status, err.class().as_str(), &err.to_string())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_conn_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    has_conn_upgrade && headers.contains_key(header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

/// Origin-form target for the upstream: `/editor/a?b` → `/a?b`.
pub fn forwarded_path(uri: &Uri) -> String {
    let pq = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let rest = pq.strip_prefix(PREFIX).unwrap_or(pq);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

/// Rewrite the inbound request for the upstream connection.
fn upstream_request(req: Request, route: &TunnelRoute, upgrade: bool) -> Result<Request, Response> {
    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    let upgrade_headers = upgrade.then(|| {
        (
            headers.get(header::CONNECTION).cloned(),
            headers.get(header::UPGRADE).cloned(),
        )
    });
    strip_hop_by_hop(&mut headers);
    if let Some((connection, upgrade_to)) = upgrade_headers {
        if let (Some(connection), Some(upgrade_to)) = (connection, upgrade_to) {
            headers.insert(header::CONNECTION, connection);
            headers.insert(header::UPGRADE, upgrade_to);
        }
    }
    // our own credential stays here
    headers.remove(header::AUTHORIZATION);
    if let Ok(host) = HeaderValue::from_str(&route.destination()) {
        headers.insert(header::HOST, host);
    }

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(forwarded_path(&parts.uri))
        .version(Version::HTTP_11);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "bad_request", &e.to_string()))
}

/// `ANY /editor/{*path}` - proxy to the configured editor service.
pub async fn editor_proxy(State(state): State<AppState>, mut req: Request) -> Response {
    let Some(route) = state.config.editor_route() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "editor_disabled",
            "editor proxy not configured",
        );
    };

    let upgrade = is_upgrade_request(req.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
    let method = req.method().clone();
    let upstream_req = match upstream_request(req, &route, upgrade) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = upstream_req.uri().to_string();

    let stream = match state.dialer.dial_with_retry(&route).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(destination = %route.destination(), class = %e.class(), "Editor dial failed: {e}");
            return dial_failure(&e);
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream)).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(destination = %route.destination(), "Editor handshake failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, "upstream_error", &e.to_string());
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Editor connection ended: {e}");
        }
    });

    let mut resp = match sender.send_request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(destination = %route.destination(), "Editor request failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, "upstream_error", &e.to_string());
        }
    };
    debug!(%method, %path, status = resp.status().as_u16(), "Editor proxied");

    if let Some(on_client) = client_upgrade {
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let on_upstream = hyper::upgrade::on(&mut resp);
            info!(%path, "Editor upgrade");
            tokio::spawn(async move {
                match futures::future::try_join(on_client, on_upstream).await {
                    Ok((client, upstream)) => {
                        let mut client = TokioIo::new(client);
                        let mut upstream = TokioIo::new(upstream);
                        if let Err(e) = copy_bidirectional(&mut client, &mut upstream).await {
                            debug!("Editor upgrade tunnel ended: {e}");
                        }
                    }
                    Err(e) => warn!("Editor upgrade failed: {e}"),
                }
            });
            let (parts, _) = resp.into_parts();
            return Response::from_parts(parts, Body::empty());
        }
    }

    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}
