#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use termbridge::{build_router, AppState, Config};

pub const KEY: &str = "test-key";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Local-mode config running `/bin/sh` in `/tmp`.
pub fn local_config() -> Config {
    let mut config = Config::default();
    config.auth.api_key = KEY.into();
    config.shell.command = "/bin/sh".into();
    config.shell.args = vec![];
    config.shell.default_working_dir = "/tmp".into();
    let runtime = std::env::temp_dir().join(format!("termbridge-test-{}", uuid::Uuid::new_v4().simple()));
    config.shell.runtime_dir = Some(runtime.to_string_lossy().into_owned());
    config
}

pub async fn start(config: Config) -> TestServer {
    let state = AppState::new(config);
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer { addr, state, task }
}

pub async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let url = format!("ws://{addr}/api/ws?{query}");
    let (ws, _) = tokio::time::timeout(Duration::from_secs(10), connect_async(url))
        .await
        .expect("ws connect timed out")
        .unwrap();
    ws
}

/// Next server message as JSON. A close frame is reported as
/// `{"type": "ws-close", "code": n}`.
pub async fn next_json(ws: &mut Ws) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => return serde_json::from_str(t.as_str()).unwrap(),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(1005, |f| u16::from(f.code));
                    return serde_json::json!({"type": "ws-close", "code": code});
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => panic!("ws error: {e}"),
                None => panic!("ws ended"),
            }
        }
    })
    .await
    .expect("no message in time")
}

/// Collect `output` data until it contains `needle`; returns everything seen.
pub async fn wait_output(ws: &mut Ws, needle: &str) -> String {
    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let msg = next_json(ws).await;
            match msg["type"].as_str() {
                Some("output") => {
                    seen.push_str(msg["data"].as_str().unwrap_or_default());
                    if seen.contains(needle) {
                        return;
                    }
                }
                Some("ping") => send_json(ws, serde_json::json!({"type": "pong"})).await,
                Some("ws-close") => panic!("closed while waiting for {needle:?}: {msg}"),
                _ => {}
            }
        }
    })
    .await;
    assert!(found.is_ok(), "timed out waiting for {needle:?}, saw {seen:?}");
    seen
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_input(ws: &mut Ws, data: &str) {
    send_json(ws, serde_json::json!({"type": "input", "data": data})).await;
}

/// Read until a close frame; returns its code.
pub async fn wait_close(ws: &mut Ws) -> u16 {
    loop {
        let msg = next_json(ws).await;
        if msg["type"] == "ws-close" {
            return u16::try_from(msg["code"].as_u64().unwrap()).unwrap();
        }
    }
}

/// One HTTP/1 request against `addr`, returning status and body bytes.
pub async fn http(
    addr: SocketAddr,
    method: Method,
    path: &str,
    token: Option<&str>,
) -> (StatusCode, Vec<u8>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let mut req = Request::builder()
        .method(method)
        .uri(path)
        .header("host", addr.to_string());
    if let Some(token) = token {
        req = req.header("authorization", format!("Bearer {token}"));
    }
    let resp = tokio::time::timeout(
        Duration::from_secs(10),
        sender.send_request(req.body(Body::empty()).unwrap()),
    )
    .await
    .expect("http request timed out")
    .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, body)
}

pub async fn http_json(addr: SocketAddr, method: Method, path: &str, token: Option<&str>) -> (StatusCode, Value) {
    let (status, body) = http(addr, method, path, token).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}
