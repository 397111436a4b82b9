//! Bridge TCP listener and per-connection protocol loop.
//!
//! A connection's first meaningful frame decides its path: `pair-request`
//! parks it until an operator decides, `hello` authenticates it with an
//! issued token. Authenticated connections then only answer `invoke` frames.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    serde_json::Value,
    tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream, tcp::{OwnedReadHalf, OwnedWriteHalf}},
        sync::{mpsc, oneshot},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    tether_common::unix_now_ms,
    tether_pairing::PairingStore,
    tether_protocol::{
        MAX_PAYLOAD_BYTES,
        bridge::{BridgeFrame, PairRequestFrame, decode_payload},
    },
};

use crate::{
    events::BridgeEvents,
    registry::{InvokeError, NodeHandle, NodeRegistry, NodeSession, PendingMap},
};

type WaitingMap = StdMutex<HashMap<String, (String, mpsc::UnboundedSender<String>)>>;

struct BridgeState {
    store: Arc<PairingStore>,
    events: Arc<dyn BridgeEvents>,
    registry: NodeRegistry,
    /// request_id → (conn_id, writer) for connections parked on pair-pending.
    waiting: WaitingMap,
}

impl BridgeState {
    fn waiting_locked(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, (String, mpsc::UnboundedSender<String>)>> {
        self.waiting.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Cloneable handle the gateway uses to reach live nodes.
#[derive(Clone)]
pub struct BridgeHandle {
    state: Arc<BridgeState>,
}

/// The bridge listener. Owns the accept loop; everything else hangs off the
/// shared state.
pub struct BridgeServer {
    state: Arc<BridgeState>,
}

impl BridgeServer {
    pub fn new(store: Arc<PairingStore>, events: Arc<dyn BridgeEvents>) -> Self {
        Self {
            state: Arc::new(BridgeState {
                store,
                events,
                registry: NodeRegistry::default(),
                waiting: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            state: self.state.clone(),
        }
    }

    /// Accept loop. Runs until the listener errors permanently.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        handle_conn(state, stream, peer).await;
                    });
                },
                Err(e) => {
                    warn!(error = %e, "bridge accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
            }
        }
    }
}

impl BridgeHandle {
    /// Run a command on a connected node. The allowlist check happens before
    /// anything touches the socket; an empty allowlist denies everything.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        let node = self
            .state
            .store
            .get(node_id)
            .ok_or(InvokeError::NotPaired)?;
        if !node.command_allowed(command) {
            return Err(InvokeError::NotAllowed);
        }

        let (tx, pending) = self
            .state
            .registry
            .channel(node_id)
            .ok_or(InvokeError::NotConnected)?;

        let id = uuid::Uuid::new_v4().to_string();
        let line = BridgeFrame::Invoke {
            id: id.clone(),
            command: command.to_string(),
            params_json: serde_json::to_string(params)?,
        }
        .to_line()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        pending_locked(&pending).insert(id.clone(), reply_tx);

        if tx.send(line).is_err() {
            pending_locked(&pending).remove(&id);
            return Err(InvokeError::NotConnected);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => {
                pending_locked(&pending).remove(&id);
                Err(InvokeError::Timeout)
            },
            Ok(Err(_)) => Err(InvokeError::NotConnected),
            Ok(Ok(BridgeFrame::InvokeRes {
                ok,
                payload_json,
                error,
                ..
            })) => {
                if ok {
                    Ok(decode_payload(payload_json.as_deref()))
                } else {
                    Err(InvokeError::Node(
                        error.unwrap_or_else(|| "node error".to_string()),
                    ))
                }
            },
            Ok(Ok(_)) => Err(InvokeError::Node("unexpected reply frame".to_string())),
        }
    }

    pub fn list_nodes(&self) -> Vec<NodeSession> {
        self.state.registry.list()
    }

    pub fn session(&self, node_id: &str) -> Option<NodeSession> {
        self.state.registry.session(node_id)
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.state.registry.is_connected(node_id)
    }

    /// Deliver a pairing decision to the connection parked on `request_id`.
    /// `Some(token)` sends `pair-ok`; `None` sends a terminal error. Returns
    /// whether a connection was still there to receive it.
    pub fn resolve_pairing(&self, request_id: &str, token: Option<&str>) -> bool {
        let entry = self.state.waiting_locked().remove(request_id);
        let Some((_, tx)) = entry else {
            return false;
        };
        let frame = match token {
            Some(token) => BridgeFrame::PairOk {
                token: token.to_string(),
            },
            None => BridgeFrame::Error {
                message: "pairing denied".to_string(),
            },
        };
        match frame.to_line() {
            Ok(line) => tx.send(line).is_ok(),
            Err(_) => false,
        }
    }

    /// Force-close a node's connection (used on unpair).
    pub async fn disconnect(&self, node_id: &str) -> bool {
        if self.state.registry.disconnect(node_id) {
            self.state.events.node_disconnected(node_id).await;
            true
        } else {
            false
        }
    }
}

fn pending_locked(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<BridgeFrame>>> {
    pending.lock().unwrap_or_else(|p| p.into_inner())
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &BridgeFrame) {
    if let Ok(line) = frame.to_line() {
        let _ = tx.send(line);
    }
}

enum LineRead {
    Frame(String),
    Oversize,
    Closed,
}

/// Read one newline-terminated frame without buffering past the payload cap,
/// so an unauthenticated peer cannot make the bridge hold an arbitrarily
/// large line in memory.
async fn read_frame_line(reader: &mut BufReader<OwnedReadHalf>) -> LineRead {
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_PAYLOAD_BYTES as u64 + 1);
    match limited.read_until(b'\n', &mut buf).await {
        Ok(0) | Err(_) => LineRead::Closed,
        Ok(_) if buf.len() > MAX_PAYLOAD_BYTES => LineRead::Oversize,
        Ok(_) => {
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            LineRead::Frame(String::from_utf8_lossy(&buf).into_owned())
        },
    }
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if half.write_all(line.as_bytes()).await.is_err()
            || half.write_all(b"\n").await.is_err()
        {
            break;
        }
    }
}

async fn handle_conn(state: Arc<BridgeState>, stream: TcpStream, peer: SocketAddr) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    debug!(conn_id = %conn_id, peer = %peer, "bridge connection opened");

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_loop(write_half, rx));

    let cancel = CancellationToken::new();
    let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
    let mut reader = BufReader::new(read_half);

    // Set once the connection authenticates with hello.
    let mut live_node: Option<String> = None;
    // Set while parked on a pair-pending reply.
    let mut waiting_request: Option<String> = None;

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = read_frame_line(&mut reader) => read,
        };
        let line = match read {
            LineRead::Frame(line) => line,
            LineRead::Oversize => {
                warn!(conn_id = %conn_id, "oversized frame");
                send_frame(&tx, &BridgeFrame::Error {
                    message: "frame too large".to_string(),
                });
                break;
            },
            LineRead::Closed => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match BridgeFrame::from_line(&line) {
            Ok(frame) => frame,
            Err(e) => {
                send_frame(&tx, &BridgeFrame::Error {
                    message: format!("bad frame: {e}"),
                });
                break;
            },
        };

        match frame {
            BridgeFrame::PairRequest(req) if live_node.is_none() => {
                match handle_pair_request(&state, &conn_id, &tx, req).await {
                    Ok(request_id) => waiting_request = Some(request_id),
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "pair request failed");
                        send_frame(&tx, &BridgeFrame::Error {
                            message: "pairing store error".to_string(),
                        });
                        break;
                    },
                }
            },
            BridgeFrame::Hello {
                node_id,
                token,
                caps,
                commands,
                bins,
            } if live_node.is_none() => {
                if !state.store.verify_token(&node_id, &token) {
                    info!(conn_id = %conn_id, node_id, "hello with bad token");
                    send_frame(&tx, &BridgeFrame::Error {
                        message: "unauthorized".to_string(),
                    });
                    break;
                }
                let record = match state
                    .store
                    .touch_connected(&node_id, caps.as_deref(), commands.as_deref())
                {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(node_id, error = %e, "failed to refresh node record");
                        send_frame(&tx, &BridgeFrame::Error {
                            message: "pairing store error".to_string(),
                        });
                        break;
                    },
                };
                if let Some(bins) = bins.as_deref()
                    && let Err(e) = state.store.set_bins(&node_id, bins)
                {
                    warn!(node_id, error = %e, "failed to record node bins");
                }

                let session = NodeSession {
                    node_id: node_id.clone(),
                    display_name: record.display_name.clone(),
                    platform: record.platform.clone(),
                    version: record.version.clone(),
                    caps: record.caps.clone(),
                    commands: record.commands.clone(),
                    remote_ip: Some(peer.ip().to_string()),
                    connected_at_ms: unix_now_ms(),
                };
                state.registry.register(NodeHandle {
                    conn_id: conn_id.clone(),
                    session: session.clone(),
                    tx: tx.clone(),
                    pending: pending.clone(),
                    cancel: cancel.clone(),
                });
                live_node = Some(node_id.clone());
                send_frame(&tx, &BridgeFrame::HelloOk);
                info!(node_id, peer = %peer, "node connected");
                state.events.node_connected(&session).await;
            },
            BridgeFrame::InvokeRes { ref id, .. } if live_node.is_some() => {
                let sender = pending_locked(&pending).remove(id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(frame);
                    },
                    None => debug!(id, "unmatched invoke-res"),
                }
            },
            BridgeFrame::Bye => {
                debug!(conn_id = %conn_id, "node said bye");
                break;
            },
            other => {
                debug!(conn_id = %conn_id, frame = ?other, "unexpected frame");
                send_frame(&tx, &BridgeFrame::Error {
                    message: "unexpected frame".to_string(),
                });
                break;
            },
        }
    }

    // Cleanup. Outstanding invokes fail when their senders drop.
    if let Some(request_id) = waiting_request {
        let mut waiting = state.waiting_locked();
        if waiting
            .get(&request_id)
            .is_some_and(|(owner, _)| *owner == conn_id)
        {
            waiting.remove(&request_id);
        }
    }
    pending_locked(&pending).clear();
    if let Some(node_id) = live_node
        && state.registry.unregister(&node_id, &conn_id)
    {
        info!(node_id, "node disconnected");
        state.events.node_disconnected(&node_id).await;
    }
    drop(tx);
    let _ = writer.await;
    debug!(conn_id = %conn_id, "bridge connection closed");
}

/// Store (or re-find) the pairing request and park the connection. The
/// operator event fires only for newly created requests.
async fn handle_pair_request(
    state: &Arc<BridgeState>,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<String>,
    req: PairRequestFrame,
) -> tether_pairing::Result<String> {
    let (request, created) = state.store.upsert_request(
        &req.node_id,
        req.display_name.as_deref(),
        &req.platform,
        &req.version,
        req.device_family.as_deref(),
        req.model_identifier.as_deref(),
        &req.caps,
        &req.commands,
        req.permissions.clone(),
        req.is_repair,
    )?;

    state
        .waiting_locked()
        .insert(request.request_id.clone(), (conn_id.to_string(), tx.clone()));

    send_frame(tx, &BridgeFrame::PairPending {
        request_id: request.request_id.clone(),
    });
    if created {
        state.events.pair_requested(&request).await;
    }
    Ok(request.request_id)
}
