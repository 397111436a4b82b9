//! Gateway-level methods: liveness and status.

use tether_common::unix_now_ms;

use crate::methods::{MethodContext, MethodRegistry, MethodResult, method};

pub(crate) fn register(registry: &mut MethodRegistry) {
    method!(registry, "health", health);
    method!(registry, "status", status);
}

async fn health(_ctx: MethodContext) -> MethodResult {
    Ok(serde_json::json!({ "ok": true, "ts": unix_now_ms() }))
}

async fn status(ctx: MethodContext) -> MethodResult {
    let state = &ctx.state;
    let nodes = state.bridge.list_nodes();
    Ok(serde_json::json!({
        "version": state.version,
        "hostname": state.hostname,
        "uptimeMs": state.uptime_ms(),
        "connections": state.broadcaster.client_count().await,
        "nodesConnected": nodes.len(),
        "channels": state.channels.snapshot().await,
    }))
}
