mod common;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use hyper::{Method, StatusCode};
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use common::{connect, http, http_json, local_config, next_json, send_input, start, wait_close, wait_output, KEY};
use termbridge::config::EditorConfig;
use termbridge::Config;

/// SOCKS5 proxy that forwards every CONNECT to `target`, whatever name was
/// asked for, and reports the requested destinations.
async fn overlay_proxy(target: SocketAddr) -> (SocketAddr, mpsc::UnboundedReceiver<(String, u16)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                client.read_exact(&mut head).await.unwrap();
                let mut methods = vec![0u8; head[1] as usize];
                client.read_exact(&mut methods).await.unwrap();
                client.write_all(&[5, 0]).await.unwrap();

                let mut req = [0u8; 4];
                client.read_exact(&mut req).await.unwrap();
                let host = match req[3] {
                    3 => {
                        let mut len = [0u8; 1];
                        client.read_exact(&mut len).await.unwrap();
                        let mut name = vec![0u8; len[0] as usize];
                        client.read_exact(&mut name).await.unwrap();
                        String::from_utf8(name).unwrap()
                    }
                    _ => {
                        let mut ip = [0u8; 4];
                        client.read_exact(&mut ip).await.unwrap();
                        std::net::Ipv4Addr::from(ip).to_string()
                    }
                };
                let mut port = [0u8; 2];
                client.read_exact(&mut port).await.unwrap();
                let _ = tx.send((host, u16::from_be_bytes(port)));

                let Ok(mut upstream) = TcpStream::connect(target).await else {
                    let _ = client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await;
                    return;
                };
                client.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await.unwrap();
                let _ = copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    (addr, rx)
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn remote_config(proxy: SocketAddr, shell_host_port: u16) -> Config {
    let mut config = local_config();
    config.auth.api_key = "browser-key".into();
    config.tunnel.remote = true;
    config.tunnel.proxy = Some(proxy.to_string());
    config.tunnel.host = "shellhost.overlay".into();
    config.tunnel.port = shell_host_port;
    config.tunnel.remote_token = Some(KEY.into());
    config.tunnel.dial_timeout_ms = 2000;
    config
}

#[tokio::test]
async fn remote_attachment_relays_through_socks5() {
    let shell_host = start(local_config()).await;
    let (proxy, mut asked) = overlay_proxy(shell_host.addr).await;
    let bridge = start(remote_config(proxy, shell_host.addr.port())).await;

    let mut ws = connect(bridge.addr, "token=browser-key&session=relayed&rows=30&cols=100").await;
    assert_eq!(next_json(&mut ws).await["type"], "mode-sync");
    send_input(&mut ws, "echo relayed-$((6*7))\n").await;
    wait_output(&mut ws, "relayed-42").await;

    let (host, port) = asked.recv().await.unwrap();
    assert_eq!(host, "shellhost.overlay");
    assert_eq!(port, shell_host.addr.port());

    // sessions live on the shell host only
    assert!(bridge.state.registry.is_empty().await);
    let session = shell_host.state.registry.get("relayed").await.unwrap();
    assert_eq!(session.geometry().await, (30, 100));

    // remote close reasons pass through unchanged
    assert!(shell_host.state.registry.kill("relayed").await);
    assert_eq!(wait_close(&mut ws).await, 4003);
}

#[tokio::test]
async fn unreachable_proxy_closes_with_proxy_unreachable() {
    let bridge = start(remote_config(closed_port().await, 7681)).await;
    let mut ws = connect(bridge.addr, "token=browser-key&session=nowhere").await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["reason"], "proxy_unreachable");
    assert_eq!(wait_close(&mut ws).await, 4010);

    let (_, health) = http_json(bridge.addr, Method::GET, "/api/health", None).await;
    assert_eq!(health["tunnel"]["remote"], true);
    assert_eq!(health["tunnel"]["dials"]["proxy_unreachable"], 1);
}

#[tokio::test]
async fn remote_mode_still_checks_the_local_token() {
    let shell_host = start(local_config()).await;
    let (proxy, _asked) = overlay_proxy(shell_host.addr).await;
    let bridge = start(remote_config(proxy, shell_host.addr.port())).await;
    let mut ws = connect(bridge.addr, &format!("token={KEY}&session=relayed")).await;
    assert_eq!(wait_close(&mut ws).await, 4001);
}

async fn editor_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/", get(|| async { "editor-root" }))
        .route("/static/{name}", get(|axum::extract::Path(name): axum::extract::Path<String>| async move {
            format!("asset:{name}")
        }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn with_editor(mut config: Config, addr: SocketAddr) -> Config {
    config.editor = Some(EditorConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        via_tunnel: true,
        max_attempts: 2,
    });
    config
}

#[tokio::test]
async fn editor_requests_are_proxied() {
    let upstream = editor_upstream().await;
    let server = start(with_editor(local_config(), upstream)).await;

    let (status, body) = http(server.addr, Method::GET, "/editor/static/app.js", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"asset:app.js");

    let (status, body) = http(server.addr, Method::GET, "/editor", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"editor-root");

    let (status, _) = http(server.addr, Method::GET, "/editor", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn editor_goes_through_the_tunnel_in_remote_mode() {
    let upstream = editor_upstream().await;
    let (proxy, mut asked) = overlay_proxy(upstream).await;
    let mut config = with_editor(remote_config(proxy, 7681), upstream);
    if let Some(editor) = config.editor.as_mut() {
        editor.host = "editor.overlay".into();
    }
    let server = start(config).await;

    let (status, body) = http(server.addr, Method::GET, "/editor/", Some("browser-key")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"editor-root");
    assert_eq!(asked.recv().await.unwrap().0, "editor.overlay");
}

#[tokio::test]
async fn editor_dial_failure_is_bad_gateway() {
    let server = start(with_editor(local_config(), closed_port().await)).await;
    let (status, body) = http_json(server.addr, Method::GET, "/editor/", Some(KEY)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "destination_unreachable");
    assert_eq!(server.state.dialer.stats().to_json()["destination_unreachable"], 2);
}

#[tokio::test]
async fn editor_disabled_is_not_found() {
    let server = start(local_config()).await;
    let (status, _) = http(server.addr, Method::GET, "/editor/", Some(KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
