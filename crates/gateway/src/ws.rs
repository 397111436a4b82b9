//! WebSocket connection handling: the connect handshake, then the RPC
//! message loop.
//!
//! Failed authentication answers with UNAUTHORIZED and leaves the socket open
//! so the client can retry with corrected credentials. A protocol-version
//! mismatch is not recoverable and closes the socket.

use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicU64},
    time::{Duration, Instant},
};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt, stream::SplitSink},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use tether_protocol::{
    ConnectAuthResult, ConnectOk, ConnectParams, ErrorShape, Features, GatewayFrame,
    HANDSHAKE_TIMEOUT_MS, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION, Policy, RequestFrameInner,
    ResponseFrame, ServerInfo, error_codes,
};

use crate::{
    auth::authorize_connect,
    methods::{MethodContext, MethodRegistry},
    state::{CLIENT_QUEUE_DEPTH, ConnectedClient, GatewayState},
};

/// Events a client may receive, advertised in the connect response.
pub const EVENT_NAMES: &[&str] = &[
    "tick",
    "presence",
    "chat.delta",
    "chat.final",
    "chat.aborted",
    "node.pair.requested",
    "node.pair.resolved",
];

type WsSink = SplitSink<WebSocket, Message>;

async fn send_response(sink: &mut WsSink, frame: &ResponseFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize response frame");
            false
        },
    }
}

/// Responses go through the same per-client queue as broadcasts so a
/// connection sees them in order, but they wait for room instead of being
/// dropped on a full queue.
async fn queue_response(sender: &mpsc::Sender<String>, frame: &ResponseFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = sender.send(json).await;
        },
        Err(e) => warn!(error = %e, "failed to serialize response frame"),
    }
}

struct Handshake {
    params: ConnectParams,
    request_id: String,
    role: String,
    scopes: Vec<String>,
}

pub async fn handle_socket(
    state: Arc<GatewayState>,
    registry: Arc<MethodRegistry>,
    socket: WebSocket,
    peer: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    debug!(conn_id = %conn_id, peer = %peer, "websocket opened");

    let (mut sink, mut stream) = socket.split();

    let Some(handshake) = run_handshake(&state, &mut sink, &mut stream, &conn_id).await else {
        debug!(conn_id = %conn_id, "handshake did not complete");
        let _ = sink.close().await;
        return;
    };

    // Register before the connect response goes out so no broadcast published
    // after the snapshot can be missed.
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_QUEUE_DEPTH);
    state
        .broadcaster
        .register(ConnectedClient {
            conn_id: conn_id.clone(),
            client_id: handshake.params.client.id.clone(),
            device_id: handshake.params.device.id.clone(),
            role: handshake.role.clone(),
            scopes: handshake.scopes.clone(),
            sender: tx.clone(),
            connected_at: Instant::now(),
            seq: AtomicU64::new(0),
        })
        .await;

    let connect_ok = ConnectOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            host: Some(state.hostname.clone()),
            conn_id: conn_id.clone(),
        },
        features: Features {
            methods: registry.method_names(),
            events: EVENT_NAMES.iter().map(|s| s.to_string()).collect(),
        },
        snapshot: state.snapshot().await,
        auth: ConnectAuthResult {
            role: handshake.role.clone(),
            scopes: handshake.scopes.clone(),
            issued_at_ms: tether_common::unix_now_ms(),
        },
        policy: Policy::default_policy(),
    };
    let payload = match serde_json::to_value(&connect_ok) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "failed to build connect response");
            state.broadcaster.remove(&conn_id).await;
            let _ = sink.close().await;
            return;
        },
    };
    if !send_response(&mut sink, &ResponseFrame::ok(&handshake.request_id, payload)).await {
        state.broadcaster.remove(&conn_id).await;
        return;
    }
    info!(
        conn_id = %conn_id,
        client = %handshake.params.client.id,
        role = %handshake.role,
        peer = %peer,
        "client connected"
    );

    // Writer drains the per-client queue; broadcasts and responses share it.
    let writer = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Binary(_)) => {
                debug!(conn_id = %conn_id, "binary frame on text protocol");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id = %conn_id, bytes = text.len(), "oversized frame");
            break;
        }

        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "unparseable frame");
                queue_response(
                    &tx,
                    &ResponseFrame::err("", ErrorShape::invalid("unparseable frame")),
                )
                .await;
                continue;
            },
        };

        match frame {
            GatewayFrame::Request(req) => {
                if req.method == "connect" {
                    queue_response(
                        &tx,
                        &ResponseFrame::err(&req.id, ErrorShape::invalid("already connected")),
                    )
                    .await;
                    continue;
                }
                dispatch_request(&state, &registry, &conn_id, &handshake, &tx, req);
            },
            GatewayFrame::Response(res) => {
                debug!(conn_id = %conn_id, id = %res.id, "ignoring response frame from client");
            },
            GatewayFrame::Event(event) => {
                debug!(conn_id = %conn_id, event = %event.event, "ignoring event frame from client");
            },
        }
    }

    state.broadcaster.remove(&conn_id).await;
    drop(tx);
    let _ = writer.await;
    info!(conn_id = %conn_id, "client disconnected");
}

/// Run one method call off the read loop, so a blocking method like
/// `chat.wait` cannot stall the connection.
fn dispatch_request(
    state: &Arc<GatewayState>,
    registry: &Arc<MethodRegistry>,
    conn_id: &str,
    handshake: &Handshake,
    tx: &mpsc::Sender<String>,
    req: RequestFrameInner,
) {
    let ctx = MethodContext {
        request_id: req.id,
        method: req.method,
        params: req.params.unwrap_or(serde_json::Value::Null),
        client_conn_id: conn_id.to_string(),
        client_role: handshake.role.clone(),
        client_scopes: handshake.scopes.clone(),
        state: state.clone(),
    };
    let registry = registry.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let response = registry.dispatch(ctx).await;
        queue_response(&tx, &response).await;
    });
}

/// Drive connect attempts until one succeeds or the socket must close.
/// UNAUTHORIZED answers keep the loop alive for a retry.
async fn run_handshake(
    state: &Arc<GatewayState>,
    sink: &mut WsSink,
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    conn_id: &str,
) -> Option<Handshake> {
    loop {
        let deadline = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
        let message = match tokio::time::timeout(deadline, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_)) | None) => return None,
            Err(_) => {
                debug!(conn_id = %conn_id, "handshake timed out");
                return None;
            },
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) | Message::Binary(_) => return None,
        };
        if text.len() > MAX_PAYLOAD_BYTES {
            return None;
        }

        let req = match serde_json::from_str::<GatewayFrame>(&text) {
            Ok(GatewayFrame::Request(req)) if req.method == "connect" => req,
            Ok(GatewayFrame::Request(req)) => {
                send_response(
                    sink,
                    &ResponseFrame::err(&req.id, ErrorShape::invalid("connect required")),
                )
                .await;
                return None;
            },
            Ok(_) | Err(_) => {
                send_response(
                    sink,
                    &ResponseFrame::err("", ErrorShape::invalid("connect required")),
                )
                .await;
                return None;
            },
        };

        let params: ConnectParams =
            match serde_json::from_value(req.params.clone().unwrap_or(serde_json::Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    send_response(
                        sink,
                        &ResponseFrame::err(
                            &req.id,
                            ErrorShape::invalid(format!("bad connect params: {e}")),
                        ),
                    )
                    .await;
                    return None;
                },
            };

        if PROTOCOL_VERSION < params.min_protocol || PROTOCOL_VERSION > params.max_protocol {
            send_response(
                sink,
                &ResponseFrame::err(
                    &req.id,
                    ErrorShape::new(
                        error_codes::INVALID_REQUEST,
                        format!(
                            "no protocol overlap: server speaks {PROTOCOL_VERSION}, client wants {}..={}",
                            params.min_protocol, params.max_protocol
                        ),
                    ),
                ),
            )
            .await;
            return None;
        }

        match authorize_connect(&state.auth, &params, tether_common::unix_now_ms()) {
            Ok(granted) => {
                return Some(Handshake {
                    params,
                    request_id: req.id,
                    role: granted.role,
                    scopes: granted.scopes,
                });
            },
            Err(err) => {
                info!(conn_id = %conn_id, reason = %err.message, "connect rejected");
                if !send_response(sink, &ResponseFrame::err(&req.id, err)).await {
                    return None;
                }
                // Socket stays open; the client may retry.
            },
        }
    }
}
