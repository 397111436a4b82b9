//! Event sink implementations wiring the bridge and chat coordinator into
//! the broadcast fan-out.

use std::sync::Arc;

use async_trait::async_trait;

use {
    tether_bridge::{BridgeEvents, NodeSession},
    tether_chat::{ChatEvent, ChatEvents},
    tether_pairing::PairingRequest,
};

use crate::{broadcast::broadcast, state::Broadcaster};

pub struct BridgeBroadcast {
    pub broadcaster: Arc<Broadcaster>,
}

#[async_trait]
impl BridgeEvents for BridgeBroadcast {
    async fn pair_requested(&self, request: &PairingRequest) {
        broadcast(
            &self.broadcaster,
            "node.pair.requested",
            serde_json::json!({ "request": request }),
        )
        .await;
    }

    async fn node_connected(&self, node: &NodeSession) {
        broadcast(
            &self.broadcaster,
            "presence",
            serde_json::json!({
                "type": "node.connected",
                "nodeId": node.node_id,
                "platform": node.platform,
            }),
        )
        .await;
    }

    async fn node_disconnected(&self, node_id: &str) {
        broadcast(
            &self.broadcaster,
            "presence",
            serde_json::json!({
                "type": "node.disconnected",
                "nodeId": node_id,
            }),
        )
        .await;
    }
}

pub struct ChatBroadcast {
    pub broadcaster: Arc<Broadcaster>,
}

#[async_trait]
impl ChatEvents for ChatBroadcast {
    async fn emit(&self, session_key: &str, event: ChatEvent) {
        let name = match &event {
            ChatEvent::Delta { .. } => "chat.delta",
            ChatEvent::Final { .. } => "chat.final",
            ChatEvent::Aborted { .. } => "chat.aborted",
        };
        let Ok(mut payload) = serde_json::to_value(&event) else {
            return;
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("kind");
            obj.insert("sessionKey".to_string(), serde_json::json!(session_key));
        }
        broadcast(&self.broadcaster, name, payload).await;
    }
}
