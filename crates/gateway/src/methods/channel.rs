//! Channel lifecycle methods.

use {
    tether_channels::ManagerError,
    tether_protocol::{ErrorShape, error_codes},
};

use crate::methods::{MethodContext, MethodRegistry, MethodResult, method};

pub(crate) fn register(registry: &mut MethodRegistry) {
    method!(registry, "channels.status", channels_status);
    method!(registry, "channels.start", channels_start);
    method!(registry, "channels.stop", channels_stop);
    method!(registry, "channels.logout", channels_logout);
}

fn manager_error(err: ManagerError) -> ErrorShape {
    match err {
        ManagerError::UnknownChannel(_) | ManagerError::UnknownAccount(_) => {
            ErrorShape::new(error_codes::NOT_FOUND, err.to_string())
        },
    }
}

async fn channels_status(ctx: MethodContext) -> MethodResult {
    let accounts = ctx.state.channels.snapshot().await;
    Ok(serde_json::json!({ "accounts": accounts }))
}

async fn channels_start(ctx: MethodContext) -> MethodResult {
    let channel = ctx.str_param("channel")?;
    let account = ctx.opt_str_param("account");
    let accounts = ctx
        .state
        .channels
        .start_channel(&channel, account.as_deref())
        .await
        .map_err(manager_error)?;
    Ok(serde_json::json!({ "accounts": accounts }))
}

async fn channels_stop(ctx: MethodContext) -> MethodResult {
    let channel = ctx.str_param("channel")?;
    let account = ctx.opt_str_param("account");
    let accounts = ctx
        .state
        .channels
        .stop_channel(&channel, account.as_deref())
        .await
        .map_err(manager_error)?;
    Ok(serde_json::json!({ "accounts": accounts }))
}

async fn channels_logout(ctx: MethodContext) -> MethodResult {
    let channel = ctx.str_param("channel")?;
    let account = ctx
        .opt_str_param("account")
        .unwrap_or_else(|| "default".to_string());
    let snapshot = ctx
        .state
        .channels
        .logout(&channel, &account)
        .await
        .map_err(manager_error)?;
    Ok(serde_json::json!({ "account": snapshot }))
}
