use {async_trait::async_trait, tether_pairing::PairingRequest};

use crate::registry::NodeSession;

/// Sink for bridge lifecycle events. The gateway implements this to turn
/// them into operator broadcasts.
#[async_trait]
pub trait BridgeEvents: Send + Sync {
    /// A new pairing request was stored. Not fired for duplicate requests
    /// from a node that already has one pending.
    async fn pair_requested(&self, request: &PairingRequest);

    /// A paired node authenticated and is now live.
    async fn node_connected(&self, node: &NodeSession);

    /// A live node's connection closed.
    async fn node_disconnected(&self, node_id: &str);
}
