mod common;

use std::time::Duration;

use hyper::{Method, StatusCode};
use serde_json::json;

use common::{connect, http_json, local_config, next_json, send_input, send_json, start, wait_close, wait_output, KEY};

#[tokio::test]
async fn echo_resize_and_replay_on_reattach() {
    let server = start(local_config()).await;
    let query = format!("token={KEY}&session=e2e-echo");

    let mut ws = connect(server.addr, &query).await;
    let first = next_json(&mut ws).await;
    assert_eq!(first, json!({"type": "mode-sync", "mode": "fancy"}));

    send_input(&mut ws, "echo hi-$((40+2))\n").await;
    wait_output(&mut ws, "hi-42").await;

    send_json(&mut ws, json!({"type": "resize", "rows": 40, "cols": 120})).await;
    send_input(&mut ws, "stty size\n").await;
    wait_output(&mut ws, "40 120").await;

    let pid = server.state.registry.get("e2e-echo").await.unwrap().pid();
    drop(ws);

    let mut again = connect(server.addr, &query).await;
    assert_eq!(next_json(&mut again).await["type"], "mode-sync");
    let replay = wait_output(&mut again, "40 120").await;
    assert!(replay.contains("hi-42"), "replay was {replay:?}");
    assert_eq!(server.state.registry.get("e2e-echo").await.unwrap().pid(), pid);
    assert_eq!(server.state.registry.len().await, 1);
}

#[tokio::test]
async fn mode_toggle_reaches_other_attachments() {
    let server = start(local_config()).await;
    let query = format!("token={KEY}&session=e2e-mode");

    let mut a = connect(server.addr, &query).await;
    assert_eq!(next_json(&mut a).await["mode"], "fancy");
    let mut b = connect(server.addr, &query).await;
    assert_eq!(next_json(&mut b).await["mode"], "fancy");

    send_json(&mut a, json!({"type": "mode-toggle", "mode": "simple"})).await;
    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = next_json(&mut b).await;
            if msg["type"] == "mode-sync" {
                return msg;
            }
        }
    })
    .await
    .expect("peer never saw mode-sync");
    assert_eq!(synced["mode"], "simple");

    // a late joiner starts in the new mode
    let mut c = connect(server.addr, &query).await;
    assert_eq!(next_json(&mut c).await, json!({"type": "mode-sync", "mode": "simple"}));
}

#[tokio::test]
async fn bad_token_closes_with_auth() {
    let server = start(local_config()).await;
    let mut ws = connect(server.addr, "token=nope&session=e2e-auth").await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "close");
    assert_eq!(msg["reason"], "auth");
    assert_eq!(wait_close(&mut ws).await, 4001);
    assert!(server.state.registry.is_empty().await);
}

#[tokio::test]
async fn malformed_message_closes_only_that_attachment() {
    let server = start(local_config()).await;
    let query = format!("token={KEY}&session=e2e-proto");

    let mut good = connect(server.addr, &query).await;
    next_json(&mut good).await;
    let mut bad = connect(server.addr, &query).await;
    next_json(&mut bad).await;

    send_json(&mut bad, json!({"type": "resize", "rows": 0, "cols": 80})).await;
    assert_eq!(wait_close(&mut bad).await, 4007);

    send_input(&mut good, "echo still-$((1+1))\n").await;
    wait_output(&mut good, "still-2").await;
}

#[tokio::test]
async fn process_exit_closes_with_process_exited() {
    let server = start(local_config()).await;
    let mut ws = connect(server.addr, &format!("token={KEY}&session=e2e-exit")).await;
    next_json(&mut ws).await;
    send_input(&mut ws, "exit\n").await;
    assert_eq!(wait_close(&mut ws).await, 4004);
}

#[tokio::test]
async fn operator_kill_closes_with_killed() {
    let server = start(local_config()).await;
    let mut ws = connect(server.addr, &format!("token={KEY}&session=e2e-kill")).await;
    next_json(&mut ws).await;

    let (status, _) = http_json(server.addr, Method::DELETE, "/api/sessions/e2e-kill", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = http_json(server.addr, Method::GET, "/api/sessions", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"][0]["key"], "e2e-kill");
    assert_eq!(body["sessions"][0]["attachments"], 1);

    let (status, body) = http_json(server.addr, Method::DELETE, "/api/sessions/e2e-kill", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(wait_close(&mut ws).await, 4003);

    let (status, _) = http_json(server.addr, Method::DELETE, "/api/sessions/e2e-kill", Some(KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn derived_keys_separate_clients() {
    let server = start(local_config()).await;
    let mut phone = connect(server.addr, &format!("token={KEY}&client=phone")).await;
    next_json(&mut phone).await;
    let mut laptop = connect(server.addr, &format!("token={KEY}&client=laptop")).await;
    next_json(&mut laptop).await;
    let mut phone_again = connect(server.addr, &format!("token={KEY}&client=phone")).await;
    next_json(&mut phone_again).await;
    assert_eq!(server.state.registry.len().await, 2);
}

#[tokio::test]
async fn silent_client_is_dropped_by_heartbeat() {
    let mut config = local_config();
    config.heartbeat.interval_secs = 1;
    config.heartbeat.grace_secs = 1;
    let server = start(config).await;
    let mut ws = connect(server.addr, &format!("token={KEY}&session=e2e-hb")).await;

    // read without answering probes
    let code = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let msg = next_json(&mut ws).await;
            if msg["type"] == "ws-close" {
                return msg["code"].as_u64();
            }
        }
    })
    .await
    .expect("heartbeat never expired");
    assert_eq!(code, Some(4002));
    // the session outlives the attachment
    assert!(server.state.registry.get("e2e-hb").await.is_some());
}

#[tokio::test]
async fn health_is_public() {
    let server = start(local_config()).await;
    let (status, body) = http_json(server.addr, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tunnel"]["remote"], false);
    assert_eq!(body["editor"], false);
}
