//! End-to-end gateway tests over a real WebSocket client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    tokio::net::{TcpListener, TcpStream},
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

use {
    tether_bridge::BridgeServer,
    tether_channels::{ChannelManager, ChannelRegistry},
    tether_chat::{AgentRunner, ChatCoordinator, RunHandle},
    tether_config::schema::AuthConfig,
    tether_gateway::{BridgeBroadcast, Broadcaster, ChatBroadcast, GatewayServer, GatewayState},
    tether_identity::{DeviceIdentity, build_auth_payload},
    tether_pairing::PairingStore,
    tether_sessions::SessionStore,
};

struct EchoRunner;

#[async_trait::async_trait]
impl AgentRunner for EchoRunner {
    async fn run(
        &self,
        _session_key: &str,
        message: &str,
        _history: Vec<serde_json::Value>,
        handle: RunHandle,
    ) -> tether_chat::Result<String> {
        handle.delta("thinking").await;
        Ok(format!("echo: {message}"))
    }
}

async fn spawn_gateway(auth: AuthConfig) -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Arc::new(Broadcaster::default());
    let store = Arc::new(PairingStore::load(dir.path().join("pairing.json")).unwrap());

    let bridge = BridgeServer::new(
        store.clone(),
        Arc::new(BridgeBroadcast {
            broadcaster: broadcaster.clone(),
        }),
    );
    let bridge_handle = bridge.handle();

    let channels = Arc::new(ChannelManager::new(ChannelRegistry::new(), HashMap::new()));
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
    let chat = Arc::new(ChatCoordinator::new(
        Arc::new(EchoRunner),
        Arc::new(ChatBroadcast {
            broadcaster: broadcaster.clone(),
        }),
        sessions,
        Duration::from_secs(5),
    ));

    let state = Arc::new(GatewayState::new(
        auth,
        store,
        bridge_handle,
        channels,
        chat,
        broadcaster,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(GatewayServer::new(state).run(listener));
    (addr, dir)
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn ws_connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

fn connect_frame(
    identity: &DeviceIdentity,
    token: Option<&str>,
    scopes: &[&str],
    request_id: &str,
) -> String {
    let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
    let signed_at = tether_common::unix_now_ms();
    let payload = build_auth_payload(
        identity.device_id(),
        "test-cli",
        "operator",
        "operator",
        &scopes,
        signed_at,
        token,
    );
    serde_json::json!({
        "type": "req",
        "id": request_id,
        "method": "connect",
        "params": {
            "minProtocol": 1,
            "maxProtocol": 1,
            "client": {
                "id": "test-cli",
                "version": "0.0.0",
                "platform": "test",
                "mode": "operator",
            },
            "role": "operator",
            "scopes": if scopes.is_empty() { serde_json::Value::Null } else {
                serde_json::json!(scopes)
            },
            "device": {
                "id": identity.device_id(),
                "publicKey": identity.public_key_b64(),
                "signature": identity.sign(&payload),
                "signedAt": signed_at,
            },
            "auth": token.map(|t| serde_json::json!({ "token": t })),
        },
    })
    .to_string()
}

async fn next_json(ws: &mut Ws) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read frames until the response with `id` arrives, discarding events.
async fn response_for(ws: &mut Ws, id: &str) -> serde_json::Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

async fn request(
    ws: &mut Ws,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let frame = tether_protocol::RequestFrame::new(id, method, params);
    let text = serde_json::to_string(&frame).unwrap();
    ws.send(Message::text(text)).await.unwrap();
    response_for(ws, id).await
}

async fn handshake(ws: &mut Ws, identity: &DeviceIdentity, token: Option<&str>, scopes: &[&str]) {
    let frame = connect_frame(identity, token, scopes, "c1");
    ws.send(Message::text(frame)).await.unwrap();
    let res = response_for(ws, "c1").await;
    assert_eq!(res["ok"], true, "connect failed: {res}");
}

fn identity(dir: &tempfile::TempDir) -> DeviceIdentity {
    DeviceIdentity::load_or_create(&dir.path().join("identity.json")).unwrap()
}

#[tokio::test]
async fn rejected_connect_leaves_socket_open_for_retry() {
    let (addr, dir) = spawn_gateway(AuthConfig {
        token: Some("tok_test_123".to_string()),
        password: None,
    })
    .await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;

    ws.send(Message::text(connect_frame(&id, Some("wrong"), &[], "c1")))
        .await
        .unwrap();
    let res = response_for(&mut ws, "c1").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "UNAUTHORIZED");

    // Same socket, corrected token.
    ws.send(Message::text(connect_frame(&id, Some("tok_test_123"), &[], "c2")))
        .await
        .unwrap();
    let res = response_for(&mut ws, "c2").await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["protocol"], 1);
    assert!(res["payload"]["snapshot"].is_object());
    let methods = res["payload"]["features"]["methods"].as_array().unwrap();
    assert!(methods.iter().any(|m| m == "chat.send"));
}

#[tokio::test]
async fn protocol_mismatch_closes_socket() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;

    let mut frame: serde_json::Value =
        serde_json::from_str(&connect_frame(&id, None, &[], "c1")).unwrap();
    frame["params"]["minProtocol"] = serde_json::json!(99);
    frame["params"]["maxProtocol"] = serde_json::json!(99);
    ws.send(Message::text(frame.to_string())).await.unwrap();

    let res = response_for(&mut ws, "c1").await;
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");

    // The server hangs up after a version mismatch.
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => {},
        }
    }
}

#[tokio::test]
async fn method_before_connect_is_rejected() {
    let (addr, _dir) = spawn_gateway(AuthConfig::default()).await;
    let mut ws = ws_connect(addr).await;

    let frame = serde_json::json!({ "type": "req", "id": "r1", "method": "status" });
    ws.send(Message::text(frame.to_string())).await.unwrap();
    let res = response_for(&mut ws, "r1").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn chat_send_streams_deltas_and_final_in_order() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;
    handshake(&mut ws, &id, None, &[]).await;

    let frame = serde_json::json!({
        "type": "req",
        "id": "r1",
        "method": "chat.send",
        "params": { "message": "hello" },
    });
    ws.send(Message::text(frame.to_string())).await.unwrap();

    // The run executes concurrently, so deltas may land before the send
    // response. Collect everything until both the response and the final
    // have arrived; seq must be strictly increasing throughout.
    let mut run_id: Option<String> = None;
    let mut delta_runs: Vec<String> = Vec::new();
    let mut final_payload: Option<serde_json::Value> = None;
    let mut last_seq = 0u64;
    while run_id.is_none() || final_payload.is_none() {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "res" && frame["id"] == "r1" {
            assert_eq!(frame["ok"], true);
            run_id = Some(frame["payload"]["runId"].as_str().unwrap().to_string());
            continue;
        }
        if frame["type"] != "event" {
            continue;
        }
        let seq = frame["seq"].as_u64().unwrap();
        assert!(seq > last_seq, "seq went backwards");
        last_seq = seq;
        match frame["event"].as_str().unwrap() {
            "chat.delta" => {
                delta_runs.push(frame["payload"]["runId"].as_str().unwrap().to_string());
            },
            "chat.final" => final_payload = Some(frame["payload"].clone()),
            _ => {},
        }
    }
    let run_id = run_id.unwrap();
    let final_payload = final_payload.unwrap();
    assert_eq!(final_payload["runId"], run_id.as_str());
    assert_eq!(final_payload["status"], "ok");
    assert_eq!(final_payload["text"], "echo: hello");
    assert!(delta_runs.iter().all(|r| *r == run_id));
    assert!(!delta_runs.is_empty());

    let res = request(&mut ws, "r2", "chat.history", serde_json::json!({})).await;
    let messages = res["payload"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn read_scope_cannot_write() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;
    handshake(&mut ws, &id, None, &["operator.read"]).await;

    let res = request(&mut ws, "r1", "status", serde_json::json!({})).await;
    assert_eq!(res["ok"], true);

    let res = request(
        &mut ws,
        "r2",
        "chat.send",
        serde_json::json!({ "message": "hi" }),
    )
    .await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "NOT_ALLOWED");
}

#[tokio::test]
async fn unknown_method_is_invalid_and_keeps_socket_open() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;
    handshake(&mut ws, &id, None, &[]).await;

    let res = request(&mut ws, "r1", "no.such.method", serde_json::json!({})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");

    // The connection still works afterwards.
    let res = request(&mut ws, "r2", "health", serde_json::json!({})).await;
    assert_eq!(res["ok"], true);
}

#[tokio::test]
async fn invoke_on_unpaired_node_is_not_found() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;
    handshake(&mut ws, &id, None, &[]).await;

    let res = request(
        &mut ws,
        "r1",
        "node.invoke",
        serde_json::json!({ "nodeId": "ghost", "command": "status" }),
    )
    .await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn pairing_methods_require_pairing_scope() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;
    handshake(&mut ws, &id, None, &["operator.read", "operator.write"]).await;

    let res = request(&mut ws, "r1", "node.pair.list", serde_json::json!({})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "NOT_ALLOWED");
}

#[tokio::test]
async fn pending_node_is_describable_before_approval() {
    let (addr, dir) = spawn_gateway(AuthConfig::default()).await;
    let id = identity(&dir);
    let mut ws = ws_connect(addr).await;
    handshake(&mut ws, &id, None, &[]).await;

    let res = request(
        &mut ws,
        "r1",
        "node.pair.request",
        serde_json::json!({
            "nodeId": "n1",
            "platform": "ios",
            "caps": ["canvas"],
            "commands": ["canvas.eval"],
        }),
    )
    .await;
    assert_eq!(res["ok"], true, "pair.request failed: {res}");
    let request_id = res["payload"]["request"]["requestId"]
        .as_str()
        .unwrap()
        .to_string();

    let res = request(
        &mut ws,
        "r2",
        "node.describe",
        serde_json::json!({ "nodeId": "n1" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["node"]["paired"], false);
    assert_eq!(res["payload"]["node"]["commands"][0], "canvas.eval");
    assert!(res["payload"]["session"].is_null());

    let res = request(
        &mut ws,
        "r3",
        "node.pair.approve",
        serde_json::json!({ "requestId": request_id }),
    )
    .await;
    assert_eq!(res["ok"], true, "approve failed: {res}");

    let res = request(
        &mut ws,
        "r4",
        "node.describe",
        serde_json::json!({ "nodeId": "n1" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["node"]["paired"], true);
    // Paired but never connected over the bridge.
    assert_eq!(res["payload"]["node"]["connected"], false);
}
