//! Chat methods over the run coordinator.

use std::time::Duration;

use {
    tether_chat::{Error as ChatError, SendOutcome},
    tether_protocol::{DEFAULT_INVOKE_TIMEOUT_MS, ErrorShape, error_codes},
};

use crate::methods::{MethodContext, MethodRegistry, MethodResult, method};

const DEFAULT_SESSION: &str = "main";

pub(crate) fn register(registry: &mut MethodRegistry) {
    method!(registry, "chat.send", chat_send);
    method!(registry, "chat.abort", chat_abort);
    method!(registry, "chat.history", chat_history);
    method!(registry, "chat.wait", chat_wait);
}

fn chat_error(err: ChatError) -> ErrorShape {
    match err {
        ChatError::WrongSession | ChatError::Message { .. } => {
            ErrorShape::invalid(err.to_string())
        },
        ChatError::UnknownRun => ErrorShape::new(error_codes::NOT_FOUND, err.to_string()),
        ChatError::Io(_) | ChatError::Json(_) | ChatError::Internal { .. } => {
            ErrorShape::new(error_codes::INTERNAL, err.to_string())
        },
    }
}

fn session_key(ctx: &MethodContext) -> String {
    ctx.opt_str_param("sessionKey")
        .unwrap_or_else(|| DEFAULT_SESSION.to_string())
}

async fn chat_send(ctx: MethodContext) -> MethodResult {
    let session = session_key(&ctx);
    let message = ctx.str_param("message")?;
    // Without a client key, every send is its own run.
    let idempotency_key = ctx
        .opt_str_param("idempotencyKey")
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let outcome = ctx
        .state
        .chat
        .send(&session, &message, &idempotency_key)
        .await
        .map_err(chat_error)?;

    Ok(match outcome {
        SendOutcome::Run {
            run_id,
            status,
            replayed,
        } => serde_json::json!({
            "sessionKey": session,
            "runId": run_id,
            "status": status.as_str(),
            "replayed": replayed,
        }),
        SendOutcome::Stopped { aborted } => serde_json::json!({
            "sessionKey": session,
            "stopped": true,
            "aborted": aborted,
        }),
    })
}

async fn chat_abort(ctx: MethodContext) -> MethodResult {
    let session = session_key(&ctx);
    let run_id = ctx.opt_str_param("runId");
    let outcome = ctx
        .state
        .chat
        .abort(&session, run_id.as_deref())
        .map_err(chat_error)?;
    Ok(serde_json::json!({
        "sessionKey": session,
        "aborted": outcome.aborted,
    }))
}

async fn chat_history(ctx: MethodContext) -> MethodResult {
    let session = session_key(&ctx);
    let limit = ctx
        .params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|l| l as usize);
    let messages = ctx
        .state
        .chat
        .history(&session, limit)
        .await
        .map_err(chat_error)?;
    Ok(serde_json::json!({
        "sessionKey": session,
        "messages": messages,
    }))
}

async fn chat_wait(ctx: MethodContext) -> MethodResult {
    let session = session_key(&ctx);
    let run_id = ctx.str_param("runId")?;
    let timeout_ms = ctx
        .params
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS);

    let outcome = ctx
        .state
        .chat
        .wait(&session, &run_id, Duration::from_millis(timeout_ms))
        .await
        .map_err(chat_error)?;
    if outcome.timed_out {
        return Err(ErrorShape::new(
            error_codes::TIMEOUT,
            "run did not finish within the wait budget",
        ));
    }
    Ok(serde_json::json!({
        "sessionKey": session,
        "runId": outcome.run_id,
        "status": outcome.status.as_str(),
    }))
}
