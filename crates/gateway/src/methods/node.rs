//! Node methods: presence, invocation, and record management.

use std::time::Duration;

use {
    tether_bridge::InvokeError,
    tether_pairing as pairing,
    tether_protocol::{DEFAULT_INVOKE_TIMEOUT_MS, ErrorShape, error_codes},
};

use crate::{
    broadcast::broadcast,
    methods::{MethodContext, MethodRegistry, MethodResult, method},
    state::paired_node_json,
};

pub(crate) fn register(registry: &mut MethodRegistry) {
    method!(registry, "node.list", node_list);
    method!(registry, "node.describe", node_describe);
    method!(registry, "node.invoke", node_invoke);
    method!(registry, "node.rename", node_rename);
    method!(registry, "node.unpair", node_unpair);
}

fn invoke_error(err: InvokeError) -> ErrorShape {
    let code = match err {
        InvokeError::NotPaired | InvokeError::NotConnected => error_codes::NOT_FOUND,
        InvokeError::NotAllowed => error_codes::NOT_ALLOWED,
        InvokeError::Timeout => error_codes::TIMEOUT,
        InvokeError::Node(_) | InvokeError::Encode(_) => error_codes::INTERNAL,
    };
    ErrorShape::new(code, err.to_string())
}

fn store_error(err: pairing::Error) -> ErrorShape {
    match err {
        pairing::Error::RequestNotFound | pairing::Error::NodeNotFound => {
            ErrorShape::new(error_codes::NOT_FOUND, err.to_string())
        },
        pairing::Error::Io(_) | pairing::Error::Json(_) => {
            ErrorShape::new(error_codes::INTERNAL, err.to_string())
        },
    }
}

/// Every paired node, with live presence merged in.
async fn node_list(ctx: MethodContext) -> MethodResult {
    let nodes: Vec<serde_json::Value> = ctx
        .state
        .pairing
        .list_paired()
        .into_iter()
        .map(|node| paired_node_json(&node, ctx.state.bridge.is_connected(&node.node_id)))
        .collect();
    Ok(serde_json::json!({ "nodes": nodes }))
}

/// Paired nodes come back with their stored record and live session; nodes
/// that are still pending approval are described from their request with
/// `paired: false` so operators can inspect caps/commands before deciding.
async fn node_describe(ctx: MethodContext) -> MethodResult {
    let node_id = ctx.str_param("nodeId")?;
    if let Some(node) = ctx.state.pairing.get(&node_id) {
        let session = ctx.state.bridge.session(&node_id);
        let mut view = paired_node_json(&node, session.is_some());
        if let Some(map) = view.as_object_mut() {
            map.insert("paired".to_string(), serde_json::Value::Bool(true));
        }
        return Ok(serde_json::json!({ "node": view, "session": session }));
    }
    if let Some(request) = ctx.state.pairing.pending_for(&node_id) {
        return Ok(serde_json::json!({
            "node": {
                "nodeId": request.node_id,
                "displayName": request.display_name,
                "platform": request.platform,
                "version": request.version,
                "caps": request.caps,
                "commands": request.commands,
                "requestId": request.request_id,
                "requestedAtMs": request.requested_at_ms,
                "paired": false,
            },
            "session": serde_json::Value::Null,
        }));
    }
    Err(ErrorShape::new(error_codes::NOT_FOUND, "unknown node"))
}

async fn node_invoke(ctx: MethodContext) -> MethodResult {
    let node_id = ctx.str_param("nodeId")?;
    let command = ctx.str_param("command")?;
    let params = ctx
        .params
        .get("params")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let timeout_ms = ctx
        .params
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS);

    let payload = ctx
        .state
        .bridge
        .invoke(&node_id, &command, &params, Duration::from_millis(timeout_ms))
        .await
        .map_err(invoke_error)?;
    Ok(serde_json::json!({ "payload": payload }))
}

async fn node_rename(ctx: MethodContext) -> MethodResult {
    let node_id = ctx.str_param("nodeId")?;
    let display_name = ctx.str_param("displayName")?;
    ctx.state
        .pairing
        .rename(&node_id, &display_name)
        .map_err(store_error)?;
    Ok(serde_json::json!({ "nodeId": node_id, "displayName": display_name }))
}

/// Remove the node's record and drop its live connection if it has one.
async fn node_unpair(ctx: MethodContext) -> MethodResult {
    let node_id = ctx.str_param("nodeId")?;
    let removed = ctx.state.pairing.unpair(&node_id).map_err(store_error)?;
    let disconnected = ctx.state.bridge.disconnect(&node_id).await;
    broadcast(
        &ctx.state.broadcaster,
        "node.pair.resolved",
        serde_json::json!({
            "nodeId": removed.node_id,
            "resolution": "unpaired",
        }),
    )
    .await;
    Ok(serde_json::json!({ "nodeId": node_id, "disconnected": disconnected }))
}
