//! Live node connections and the invoke correlation table.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    tokio::sync::{mpsc, oneshot},
    tokio_util::sync::CancellationToken,
};

use tether_protocol::bridge::BridgeFrame;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("node not paired")]
    NotPaired,

    #[error("node not connected")]
    NotConnected,

    #[error("command not in allowlist")]
    NotAllowed,

    #[error("invoke timed out")]
    Timeout,

    #[error("{0}")]
    Node(String),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A connected, authenticated node.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeSession {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    #[serde(rename = "remoteIp", skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(rename = "connectedAtMs")]
    pub connected_at_ms: u64,
}

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<BridgeFrame>>>>;

pub(crate) struct NodeHandle {
    pub conn_id: String,
    pub session: NodeSession,
    /// Serialized wire lines for the connection's write loop.
    pub tx: mpsc::UnboundedSender<String>,
    pub pending: PendingMap,
    pub cancel: CancellationToken,
}

/// Registry of live node connections. Pairing state lives in the store; this
/// is presence only.
#[derive(Default)]
pub(crate) struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeHandle>>,
}

impl NodeRegistry {
    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<String, NodeHandle>> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a node connection, displacing any previous connection for the
    /// same nodeId.
    pub fn register(&self, handle: NodeHandle) {
        let mut nodes = self.locked();
        if let Some(old) = nodes.insert(handle.session.node_id.clone(), handle) {
            old.cancel.cancel();
        }
    }

    /// Remove a node only if `conn_id` still owns the slot; a displaced
    /// connection must not unregister its replacement.
    pub fn unregister(&self, node_id: &str, conn_id: &str) -> bool {
        let mut nodes = self.locked();
        match nodes.get(node_id) {
            Some(handle) if handle.conn_id == conn_id => {
                nodes.remove(node_id);
                true
            },
            _ => false,
        }
    }

    pub fn disconnect(&self, node_id: &str) -> bool {
        let mut nodes = self.locked();
        match nodes.remove(node_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            },
            None => false,
        }
    }

    pub fn session(&self, node_id: &str) -> Option<NodeSession> {
        self.locked().get(node_id).map(|h| h.session.clone())
    }

    pub fn list(&self) -> Vec<NodeSession> {
        let mut list: Vec<_> = self.locked().values().map(|h| h.session.clone()).collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.locked().contains_key(node_id)
    }

    /// Writer and correlation table for one node, if connected.
    pub fn channel(&self, node_id: &str) -> Option<(mpsc::UnboundedSender<String>, PendingMap)> {
        self.locked()
            .get(node_id)
            .map(|h| (h.tx.clone(), h.pending.clone()))
    }
}
