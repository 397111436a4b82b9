//! Pairing decision methods.
//!
//! Approvals return the plaintext token to the operator as well as pushing it
//! at the waiting node, so pairing survives the node dropping its connection
//! before the decision lands. The `delivered` flag says which happened.

use {
    tether_pairing as pairing,
    tether_protocol::{ErrorShape, error_codes},
};

use crate::{
    broadcast::broadcast,
    methods::{MethodContext, MethodRegistry, MethodResult, method},
    state::paired_node_json,
};

pub(crate) fn register(registry: &mut MethodRegistry) {
    method!(registry, "node.pair.request", pair_request);
    method!(registry, "node.pair.list", pair_list);
    method!(registry, "node.pair.approve", pair_approve);
    method!(registry, "node.pair.deny", pair_deny);
    method!(registry, "node.pair.verify", pair_verify);
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

/// Manually file a pairing request, e.g. for a node that cannot reach the
/// bridge yet. Deduplicates against an existing pending request for the same
/// node.
async fn pair_request(ctx: MethodContext) -> MethodResult {
    let node_id = ctx.str_param("nodeId")?;
    let display_name = ctx.opt_str_param("displayName");
    let platform = ctx
        .opt_str_param("platform")
        .unwrap_or_else(|| "unknown".to_string());
    let version = ctx
        .opt_str_param("version")
        .unwrap_or_else(|| "unknown".to_string());
    let string_list = |key: &str| -> Vec<String> {
        ctx.params
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let caps = string_list("caps");
    let commands = string_list("commands");

    let (request, created) = ctx
        .state
        .pairing
        .upsert_request(
            &node_id,
            display_name.as_deref(),
            &platform,
            &version,
            None,
            None,
            &caps,
            &commands,
            Default::default(),
            false,
        )
        .map_err(store_error)?;

    if created {
        broadcast(
            &ctx.state.broadcaster,
            "node.pair.requested",
            serde_json::json!({ "request": request }),
        )
        .await;
    }
    Ok(serde_json::json!({ "request": request, "created": created }))
}

async fn pair_list(ctx: MethodContext) -> MethodResult {
    let pending = ctx.state.pairing.list_pending();
    let paired: Vec<serde_json::Value> = ctx
        .state
        .pairing
        .list_paired()
        .into_iter()
        .map(|node| paired_node_json(&node, ctx.state.bridge.is_connected(&node.node_id)))
        .collect();
    Ok(serde_json::json!({ "pending": pending, "paired": paired }))
}

async fn pair_approve(ctx: MethodContext) -> MethodResult {
    let request_id = ctx.str_param("requestId")?;
    let (node, token) = ctx.state.pairing.approve(&request_id).map_err(store_error)?;
    let delivered = ctx.state.bridge.resolve_pairing(&request_id, Some(&token));

    broadcast(
        &ctx.state.broadcaster,
        "node.pair.resolved",
        serde_json::json!({
            "requestId": request_id,
            "nodeId": node.node_id,
            "resolution": "approved",
            "delivered": delivered,
        }),
    )
    .await;

    Ok(serde_json::json!({
        "node": paired_node_json(&node, false),
        "token": token,
        "delivered": delivered,
    }))
}

async fn pair_deny(ctx: MethodContext) -> MethodResult {
    let request_id = ctx.str_param("requestId")?;
    let request = ctx.state.pairing.deny(&request_id).map_err(store_error)?;
    let delivered = ctx.state.bridge.resolve_pairing(&request_id, None);

    broadcast(
        &ctx.state.broadcaster,
        "node.pair.resolved",
        serde_json::json!({
            "requestId": request_id,
            "nodeId": request.node_id,
            "resolution": "denied",
            "delivered": delivered,
        }),
    )
    .await;

    Ok(serde_json::json!({ "requestId": request_id, "nodeId": request.node_id }))
}

async fn pair_verify(ctx: MethodContext) -> MethodResult {
    let node_id = ctx.str_param("nodeId")?;
    let token = ctx.str_param("token")?;
    let valid = ctx.state.pairing.verify_token(&node_id, &token);
    Ok(serde_json::json!({ "nodeId": node_id, "valid": valid }))
}
