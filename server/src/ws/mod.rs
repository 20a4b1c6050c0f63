//! WebSocket terminal attachments.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws?token=&session=&client=&cwd=&rows=&cols=&mode=`.
//!    The upgrade always completes; a bad token is answered with an `auth`
//!    close (4001) so browsers can tell it apart from a network failure.
//! 2. In remote mode the socket is handed to [`crate::tunnel::relay`].
//!    Otherwise the session key is resolved (explicit `session`, or derived
//!    from the principal and `client`) and the attachment joins it through
//!    [`SessionRegistry::attach`](crate::sessions::SessionRegistry::attach).
//! 3. The writer task sends `mode-sync`, then the replay, then live output.
//!    Requested geometry is applied after the replay is queued.
//! 4. On client close the subscriber is removed and the session left alone.
//!    On a forced close the client gets a `close` message and a close frame
//!    carrying [`CloseReason::ws_code`].
//!
//! Message formats are in [`crate::protocol`].

pub mod attachment;
pub mod heartbeat;
pub mod outbound;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

use crate::auth::{derive_session_key, Principal};
use crate::protocol::{ClientMessage, CloseReason, DisplayMode, ServerMessage, Utf8Decoder};
use crate::sessions::buffer::Chunk;
use crate::sessions::session::Session;
use crate::sessions::{validate_session_key, SessionRequest};
use crate::AppState;
use attachment::Attachment;
use heartbeat::{Beat, Heartbeat};
use outbound::{AttachmentHandle, Kicker, Outbound, Push};

/// Bound on delivering the close message and frame to a stalled client.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client id used for key derivation when the client sends none.
const DEFAULT_CLIENT: &str = "default";

/// Query parameters for the WebSocket upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    /// API key (headers aren't available during a browser WebSocket upgrade).
    pub token: Option<String>,
    pub session: Option<String>,
    /// Device identity used to derive a key when `session` is absent.
    pub client: Option<String>,
    pub cwd: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub mode: Option<String>,
}

impl WsQuery {
    /// Explicit key if valid, otherwise one derived from `principal` + `client`.
    /// `None` when an explicit key is malformed.
    pub fn session_key(&self, principal: &Principal) -> Option<String> {
        match self.session.as_deref().filter(|s| !s.is_empty()) {
            Some(key) => validate_session_key(key).then(|| key.to_string()),
            None => Some(derive_session_key(
                principal,
                self.client.as_deref().unwrap_or(DEFAULT_CLIENT),
            )),
        }
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.mode
            .as_deref()
            .and_then(DisplayMode::parse)
            .unwrap_or_default()
    }

    pub fn request(&self) -> SessionRequest {
        SessionRequest {
            cwd: self.cwd.clone(),
            mode: self.display_mode(),
            rows: self.rows.filter(|r| *r > 0),
            cols: self.cols.filter(|c| *c > 0),
        }
    }
}

/// `GET /api/ws` - WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = state.api_key.validate(query.token.as_deref());
    ws.on_upgrade(move |socket| async move {
        let principal = match auth {
            Ok(principal) => principal,
            Err(e) => {
                warn!("WebSocket rejected: {e}");
                close_socket(socket, CloseReason::Auth).await;
                return;
            }
        };
        let Some(key) = query.session_key(&principal) else {
            warn!("WebSocket rejected: malformed session key");
            close_socket(socket, CloseReason::ProtocolError).await;
            return;
        };
        let span = info_span!("attachment", session = %key);
        if state.config.tunnel.remote {
            crate::tunnel::relay::relay(socket, state, key, query)
                .instrument(span)
                .await;
        } else {
            serve_attachment(socket, state, key, query)
                .instrument(span)
                .await;
        }
    })
}

/// JSON `close` message followed by a close frame.
pub(crate) async fn send_close<S>(sink: &mut S, reason: CloseReason)
where
    S: Sink<Message> + Unpin,
{
    let msg = ServerMessage::Close {
        reason,
        message: reason.describe().to_string(),
    };
    if let Ok(text) = serde_json::to_string(&msg) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: reason.ws_code(),
            reason: reason.as_str().into(),
        })))
        .await;
}

/// Close a socket that never joined a session.
pub(crate) async fn close_socket(mut socket: WebSocket, reason: CloseReason) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, send_close(&mut socket, reason)).await;
}

/// One local attachment: join, pump inbound frames, leave.
async fn serve_attachment(socket: WebSocket, state: AppState, key: String, query: WsQuery) {
    let (handle, rx) = outbound::channel(state.config.session.outbound_queue);
    let mut attachment = Attachment::new(handle.id, key.clone());
    let request = query.request();

    let (session, sub) = match state.registry.attach(&key, &request, &handle).await {
        Ok(joined) => joined,
        Err(e) => {
            let reason = e.close_reason();
            warn!("Attach failed: {e}");
            if let Err(e) = attachment.forced(reason) {
                warn!(attachment = %attachment.id, "{e}");
            }
            close_socket(socket, reason).await;
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let kicker = handle.kicker().clone();
    let mut writer = tokio::spawn(write_loop(sink, rx, kicker.clone(), sub.mode, sub.replay));
    if let Err(e) = attachment.joined() {
        warn!(attachment = %attachment.id, "{e}");
    }

    if let (Some(rows), Some(cols)) = (request.rows, request.cols) {
        if (rows, cols) != (sub.rows, sub.cols) {
            if let Err(e) = session.resize(rows, cols).await {
                warn!("Initial resize failed: {e}");
            }
        }
    }

    let hb_cfg = &state.config.heartbeat;
    let mut heartbeat = Heartbeat::new(
        Duration::from_secs(hb_cfg.interval_secs),
        Duration::from_secs(hb_cfg.grace_secs),
        Instant::now(),
    );
    let mut ticker = tokio::time::interval(heartbeat.tick());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = kicker.kicked() => break,
            _ = ticker.tick() => match heartbeat.poll(Instant::now()) {
                Beat::Idle => {}
                Beat::Probe => {
                    if handle.try_push(Outbound::Ping) == Push::Full {
                        handle.kick(CloseReason::SlowConsumer);
                    }
                }
                Beat::Expired => {
                    handle.kick(CloseReason::HeartbeatTimeout);
                    break;
                }
            },
            frame = stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                heartbeat.on_traffic(Instant::now());
                match frame {
                    Message::Text(text) => match ClientMessage::parse(text.as_str()) {
                        Ok(msg) => on_client_message(&session, &handle, msg).await,
                        Err(e) => {
                            warn!(attachment = %handle.id, "Protocol error: {e}");
                            handle.kick(CloseReason::ProtocolError);
                            break;
                        }
                    },
                    Message::Binary(bytes) => {
                        if session.write_input(bytes.to_vec()).await.is_err() {
                            debug!("Input dropped, process gone");
                        }
                    }
                    Message::Close(_) => break,
                    // axum answers pings itself
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    session.unsubscribe(handle.id).await;
    let kicked = kicker.reason();
    drop(handle);
    if kicked.is_some() {
        // the writer sends the close frame
        if tokio::time::timeout(CLOSE_TIMEOUT * 2, &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        writer.abort();
    }
    if let Err(e) = attachment.finish(kicked) {
        warn!(attachment = %attachment.id, "{e}");
    }
}

async fn on_client_message(session: &Arc<Session>, handle: &AttachmentHandle, msg: ClientMessage) {
    match msg {
        ClientMessage::Input { data } => {
            if session.write_input(data.into_bytes()).await.is_err() {
                debug!("Input dropped, process gone");
            }
        }
        ClientMessage::Resize { rows, cols } => {
            if let Err(e) = session.resize(rows, cols).await {
                warn!(rows, cols, "Resize failed: {e}");
            }
        }
        ClientMessage::Ping => {
            if handle.try_push(Outbound::Pong) == Push::Full {
                handle.kick(CloseReason::SlowConsumer);
            }
        }
        ClientMessage::Pong => {}
        ClientMessage::ModeToggle { mode } => session.set_mode(mode, handle.id).await,
    }
}

/// Serialize one queued item. Output that decodes to nothing (a split
/// character still waiting for its tail) produces no frame.
fn encode(decoder: &mut Utf8Decoder, item: Outbound) -> Option<Message> {
    let msg = match item {
        Outbound::Output(bytes) => {
            let data = decoder.decode(&bytes);
            if data.is_empty() {
                return None;
            }
            ServerMessage::Output { data }
        }
        Outbound::ModeSync(mode) => ServerMessage::ModeSync { mode },
        Outbound::Ping => ServerMessage::Ping,
        Outbound::Pong => ServerMessage::Pong,
    };
    match serde_json::to_string(&msg) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to serialize outbound message: {e}");
            None
        }
    }
}

/// Owns the socket sink. Sends the initial `mode-sync` and replay, then
/// drains the queue until kicked or the queue closes. A kick abandons any
/// send in flight so a stalled client cannot hold the task.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    kicker: Kicker,
    mode: DisplayMode,
    replay: Vec<Chunk>,
) {
    let mut decoder = Utf8Decoder::new();
    let mut initial = VecDeque::from([Outbound::ModeSync(mode)]);
    if !replay.is_empty() {
        let bytes: Vec<u8> = replay.iter().flat_map(|c| c.data.iter().copied()).collect();
        initial.push_back(Outbound::Output(Arc::from(bytes)));
    }

    loop {
        let item = if let Some(item) = initial.pop_front() {
            item
        } else {
            tokio::select! {
                biased;
                () = kicker.kicked() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            }
        };
        let Some(frame) = encode(&mut decoder, item) else {
            continue;
        };
        tokio::select! {
            biased;
            () = kicker.kicked() => break,
            sent = sink.send(frame) => if sent.is_err() { return },
        }
    }

    if let Some(reason) = kicker.reason() {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, send_close(&mut sink, reason)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OPERATOR;

    fn principal() -> Principal {
        Principal(OPERATOR.into())
    }

    #[test]
    fn explicit_session_key_wins() {
        let q = WsQuery {
            session: Some("s1".into()),
            client: Some("phone".into()),
            ..WsQuery::default()
        };
        assert_eq!(q.session_key(&principal()).as_deref(), Some("s1"));
    }

    #[test]
    fn malformed_session_key_is_rejected() {
        let q = WsQuery {
            session: Some("../../etc".into()),
            ..WsQuery::default()
        };
        assert_eq!(q.session_key(&principal()), None);
    }

    #[test]
    fn missing_session_key_is_derived_from_client() {
        let phone = WsQuery {
            client: Some("phone".into()),
            ..WsQuery::default()
        };
        let anon = WsQuery::default();
        let a = phone.session_key(&principal()).unwrap();
        let b = anon.session_key(&principal()).unwrap();
        assert!(a.starts_with("c-"));
        assert_ne!(a, b);
        assert_eq!(b, derive_session_key(&principal(), DEFAULT_CLIENT));
    }

    #[test]
    fn request_drops_zero_geometry_and_bad_mode() {
        let q = WsQuery {
            rows: Some(0),
            cols: Some(120),
            mode: Some("sparkly".into()),
            cwd: Some("/tmp".into()),
            ..WsQuery::default()
        };
        let r = q.request();
        assert_eq!(r.rows, None);
        assert_eq!(r.cols, Some(120));
        assert_eq!(r.mode, DisplayMode::Fancy);
        assert_eq!(r.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn encode_holds_partial_characters() {
        let mut dec = Utf8Decoder::new();
        let euro = "€".as_bytes();
        assert!(encode(&mut dec, Outbound::Output(Arc::from(&euro[..2]))).is_none());
        let Some(Message::Text(text)) = encode(&mut dec, Outbound::Output(Arc::from(&euro[2..])))
        else {
            panic!("expected a text frame");
        };
        let v: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(v["type"], "output");
        assert_eq!(v["data"], "€");
    }
}
