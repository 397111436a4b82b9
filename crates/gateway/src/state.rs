//! Shared gateway state: connected operator clients and the services the
//! method handlers reach into.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    tokio::sync::{RwLock, mpsc},
    tracing::debug,
};

use {
    tether_bridge::BridgeHandle,
    tether_channels::ChannelManager,
    tether_chat::ChatCoordinator,
    tether_config::schema::AuthConfig,
    tether_pairing::{PairedNode, PairingStore},
};

/// Wire view of a paired node: the stored record minus the token hash, plus
/// live presence.
pub(crate) fn paired_node_json(node: &PairedNode, connected: bool) -> serde_json::Value {
    let mut value = serde_json::to_value(node).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("tokenHash");
        obj.insert("connected".to_string(), serde_json::json!(connected));
    }
    value
}

/// Outstanding frames one client may have queued before the gateway starts
/// skipping it as a slow consumer.
pub const CLIENT_QUEUE_DEPTH: usize = 256;

/// A connected WebSocket client, post-handshake.
///
/// Each client carries its own event sequence counter, stamped at send time:
/// the seqs one connection observes are contiguous, so a gap means that
/// client itself missed an event and should re-sync from a snapshot.
pub struct ConnectedClient {
    pub conn_id: String,
    pub client_id: String,
    pub device_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub sender: mpsc::Sender<String>,
    pub connected_at: Instant,
    pub(crate) seq: AtomicU64,
}

impl ConnectedClient {
    /// Queue a serialized frame without blocking. Returns false when the
    /// client's queue is full or the connection is gone.
    pub fn send(&self, json: &str) -> bool {
        self.sender.try_send(json.to_string()).is_ok()
    }

    /// Next event sequence number for this connection.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Client table. Event sinks hold this directly so they do not need the full
/// gateway state.
#[derive(Default)]
pub struct Broadcaster {
    pub(crate) clients: RwLock<HashMap<String, ConnectedClient>>,
}

impl Broadcaster {
    pub async fn register(&self, client: ConnectedClient) {
        debug!(conn_id = %client.conn_id, "client registered");
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client);
    }

    pub async fn remove(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Everything a method handler can touch.
pub struct GatewayState {
    pub version: String,
    pub hostname: String,
    pub auth: AuthConfig,
    pub pairing: Arc<PairingStore>,
    pub bridge: BridgeHandle,
    pub channels: Arc<ChannelManager>,
    pub chat: Arc<ChatCoordinator>,
    pub broadcaster: Arc<Broadcaster>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        auth: AuthConfig,
        pairing: Arc<PairingStore>,
        bridge: BridgeHandle,
        channels: Arc<ChannelManager>,
        chat: Arc<ChatCoordinator>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            auth,
            pairing,
            bridge,
            channels,
            chat,
            broadcaster,
            started_at: Instant::now(),
        }
    }

    /// State snapshot included in the connect response: channel runtimes,
    /// pairing lists, and node presence.
    pub async fn snapshot(&self) -> serde_json::Value {
        let channels = self.channels.snapshot().await;
        let pending = self.pairing.list_pending();
        let paired: Vec<serde_json::Value> = self
            .pairing
            .list_paired()
            .into_iter()
            .map(|node| paired_node_json(&node, self.bridge.is_connected(&node.node_id)))
            .collect();

        serde_json::json!({
            "channels": channels,
            "pairing": { "pending": pending, "paired": paired },
            "nodes": self.bridge.list_nodes(),
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
