//! Remote mode: relay a browser attachment to the shell host.
//!
//! The shell host runs its own termbridge in local mode. For each browser
//! WebSocket this side dials it through the [`Dialer`](super::Dialer) (no
//! silent retry), performs a WebSocket client handshake over the dialed
//! stream with the upstream token, then pipes frames both ways. Close frames
//! pass through unchanged so the shell host's close reasons reach the
//! browser; a dial failure or a lost upstream is reported with the matching
//! transport reason.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{info, warn};

use super::TunnelRoute;
use crate::protocol::CloseReason;
use crate::ws::{close_socket, send_close, WsQuery};
use crate::AppState;

/// How a relayed attachment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// Browser closed or went away.
    Client,
    /// Shell host sent a close frame (already forwarded).
    HostClosed,
    /// Upstream stream ended without a close frame.
    HostLost,
}

/// `ws://host:port/api/ws?...` for the shell host, carrying the resolved
/// session key and creation parameters.
pub fn upstream_url(route: &TunnelRoute, key: &str, query: &WsQuery, token: &str) -> String {
    let mut params = url::form_urlencoded::Serializer::new(String::new());
    params.append_pair("token", token);
    params.append_pair("session", key);
    if let Some(ref cwd) = query.cwd {
        params.append_pair("cwd", cwd);
    }
    if let Some(rows) = query.rows {
        params.append_pair("rows", &rows.to_string());
    }
    if let Some(cols) = query.cols {
        params.append_pair("cols", &cols.to_string());
    }
    params.append_pair("mode", query.display_mode().as_str());
    format!("ws://{}/api/ws?{}", route.destination(), params.finish())
}

/// Relay `socket` to the shell host until either side closes.
pub async fn relay(socket: WebSocket, state: AppState, key: String, query: WsQuery) {
    let route = state.config.tunnel.shell_host_route();
    let stream = match state.dialer.dial(&route).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(class = %e.class(), "Relay dial failed: {e}");
            close_socket(socket, CloseReason::from(e.class())).await;
            return;
        }
    };

    let url = upstream_url(&route, &key, &query, state.config.remote_token());
    let upstream = match tokio_tungstenite::client_async(url.as_str(), stream).await {
        Ok((upstream, _response)) => upstream,
        Err(e) => {
            warn!(destination = %route.destination(), "Relay handshake failed: {e}");
            close_socket(socket, CloseReason::DestinationUnreachable).await;
            return;
        }
    };
    info!(
        destination = %route.destination(),
        proxy = route.proxy.as_deref().unwrap_or("direct"),
        "Relaying attachment"
    );

    let (mut client_tx, mut client_rx) = socket.split();
    let (mut host_tx, mut host_rx) = upstream.split();

    let ended = tokio::select! {
        () = async {
            while let Some(Ok(msg)) = client_rx.next().await {
                let closing = matches!(msg, Message::Close(_));
                if let Some(msg) = to_upstream(msg) {
                    if host_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                if closing {
                    break;
                }
            }
        } => Ended::Client,
        saw_close = async {
            while let Some(Ok(msg)) = host_rx.next().await {
                let closing = matches!(msg, UpstreamMessage::Close(_));
                if let Some(msg) = to_client(msg) {
                    if client_tx.send(msg).await.is_err() {
                        return false;
                    }
                }
                if closing {
                    return true;
                }
            }
            false
        } => if saw_close { Ended::HostClosed } else { Ended::HostLost },
    };

    match ended {
        Ended::HostLost => {
            warn!(destination = %route.destination(), "Upstream lost");
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                send_close(&mut client_tx, CloseReason::DestinationUnreachable),
            )
            .await;
        }
        Ended::Client => {
            let _ = host_tx.close().await;
            info!("Relay closed by client");
        }
        Ended::HostClosed => info!("Relay closed by shell host"),
    }
}

/// Browser → shell host. Control frames are answered locally on each hop.
fn to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::Text(text.as_str().to_owned().into())),
        Message::Binary(bytes) => Some(UpstreamMessage::Binary(bytes)),
        Message::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

/// Shell host → browser.
fn to_client(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        UpstreamMessage::Binary(bytes) => Some(Message::Binary(bytes)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}
