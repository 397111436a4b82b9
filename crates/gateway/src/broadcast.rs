use std::{collections::HashMap, sync::Arc};

use {
    tether_protocol::{EventFrame, scopes},
    tracing::{debug, warn},
};

use crate::state::{Broadcaster, GatewayState};

// ── Scope guards ─────────────────────────────────────────────────────────────

/// Events that require specific scopes to receive.
fn event_scope_guards() -> HashMap<&'static str, &'static [&'static str]> {
    let mut m = HashMap::new();
    m.insert("node.pair.requested", [scopes::PAIRING].as_slice());
    m.insert("node.pair.resolved", [scopes::PAIRING].as_slice());
    m
}

// ── Broadcaster ──────────────────────────────────────────────────────────────

/// Broadcast an event to all connected clients, respecting scope guards.
///
/// The `seq` is stamped per recipient, so each connection sees a contiguous
/// sequence regardless of which events its scopes let through. A frame that
/// cannot be queued (slow consumer) still consumes that client's seq; the
/// resulting gap is what tells the client it missed an event.
pub async fn broadcast(broadcaster: &Broadcaster, event: &str, payload: serde_json::Value) {
    let guards = event_scope_guards();
    let required_scopes = guards.get(event);

    let clients = broadcaster.clients.read().await;
    debug!(event, clients = clients.len(), "broadcasting event");
    for client in clients.values() {
        if let Some(required) = required_scopes {
            let has = client.has_scope(scopes::ADMIN)
                || required.iter().any(|s| client.has_scope(s));
            if !has {
                continue;
            }
        }

        let frame = EventFrame::new(event, payload.clone(), client.next_seq());
        match serde_json::to_string(&frame) {
            Ok(json) => {
                if !client.send(&json) {
                    debug!(event, conn_id = %client.conn_id, "client queue full, event dropped");
                }
            },
            Err(e) => warn!(event, error = %e, "failed to serialize broadcast event"),
        }
    }
}

/// Broadcast a tick event with the current timestamp and basic presence.
pub async fn broadcast_tick(state: &Arc<GatewayState>) {
    let connections = state.broadcaster.client_count().await;
    broadcast(
        &state.broadcaster,
        "tick",
        serde_json::json!({
            "ts": tether_common::unix_now_ms(),
            "uptimeMs": state.uptime_ms(),
            "connections": connections,
        }),
    )
    .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::AtomicU64,
        time::Instant,
    };

    use tokio::sync::mpsc;

    use {super::*, crate::state::ConnectedClient};

    fn client(conn_id: &str, scopes: &[&str], depth: usize) -> (ConnectedClient, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth);
        let client = ConnectedClient {
            conn_id: conn_id.to_string(),
            client_id: "test".to_string(),
            device_id: "dev".to_string(),
            role: "operator".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            sender: tx,
            connected_at: Instant::now(),
            seq: AtomicU64::new(0),
        };
        (client, rx)
    }

    fn drain_seqs(rx: &mut mpsc::Receiver<String>) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(json) = rx.try_recv() {
            let frame: serde_json::Value = serde_json::from_str(&json).unwrap();
            seqs.push(frame["seq"].as_u64().unwrap());
        }
        seqs
    }

    #[tokio::test]
    async fn scope_filtering_leaves_no_seq_gap() {
        let broadcaster = Broadcaster::default();
        let (reader, mut reader_rx) = client("c-read", &["operator.read"], 8);
        let (pairer, mut pairer_rx) = client("c-pair", &["operator.pairing"], 8);
        broadcaster.register(reader).await;
        broadcaster.register(pairer).await;

        broadcast(&broadcaster, "tick", serde_json::json!({})).await;
        broadcast(&broadcaster, "node.pair.requested", serde_json::json!({})).await;
        broadcast(&broadcaster, "tick", serde_json::json!({})).await;

        // The pairing client saw all three events; the read-only client was
        // filtered out of the pairing event but its sequence stays contiguous.
        assert_eq!(drain_seqs(&mut pairer_rx), vec![1, 2, 3]);
        assert_eq!(drain_seqs(&mut reader_rx), vec![1, 2]);
    }

    #[tokio::test]
    async fn slow_consumer_is_skipped_and_sees_a_gap() {
        let broadcaster = Broadcaster::default();
        let (slow, mut rx) = client("c-slow", &["operator.read"], 1);
        broadcaster.register(slow).await;

        // Queue depth 1: the second event has nowhere to go and is dropped,
        // consuming seq 2.
        broadcast(&broadcaster, "tick", serde_json::json!({"n": 1})).await;
        broadcast(&broadcaster, "tick", serde_json::json!({"n": 2})).await;
        assert_eq!(drain_seqs(&mut rx), vec![1]);

        broadcast(&broadcaster, "tick", serde_json::json!({"n": 3})).await;
        assert_eq!(drain_seqs(&mut rx), vec![3]);
    }
}
