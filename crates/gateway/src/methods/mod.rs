use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use tether_protocol::{ErrorShape, ResponseFrame, error_codes, roles};

use crate::state::GatewayState;

mod channel;
mod chat;
mod gateway;
mod node;
mod pairing;

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub client_conn_id: String,
    pub client_role: String,
    pub client_scopes: Vec<String>,
    pub state: Arc<GatewayState>,
}

impl MethodContext {
    /// Required string param, or an INVALID_REQUEST error naming it.
    pub fn str_param(&self, key: &str) -> Result<String, ErrorShape> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ErrorShape::invalid(format!("missing '{key}'")))
    }

    pub fn opt_str_param(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

// ── Scope authorization ──────────────────────────────────────────────────────

const READ_METHODS: &[&str] = &[
    "health",
    "status",
    "channels.status",
    "node.list",
    "node.describe",
    "chat.history",
    "chat.wait",
];

const WRITE_METHODS: &[&str] = &[
    "channels.start",
    "channels.stop",
    "channels.logout",
    "node.invoke",
    "chat.send",
    "chat.abort",
];

const PAIRING_METHODS: &[&str] = &[
    "node.pair.request",
    "node.pair.list",
    "node.pair.approve",
    "node.pair.deny",
    "node.pair.verify",
    "node.rename",
    "node.unpair",
];

fn is_in(method: &str, list: &[&str]) -> bool {
    list.contains(&method)
}

/// Check role + scopes for a method. Returns None if authorized, Some(error)
/// if not.
pub fn authorize_method(method: &str, role: &str, scopes: &[String]) -> Option<ErrorShape> {
    use tether_protocol::scopes as s;

    if role != roles::OPERATOR {
        return Some(ErrorShape::new(
            error_codes::NOT_ALLOWED,
            format!("unauthorized role: {role}"),
        ));
    }

    let has = |scope: &str| scopes.iter().any(|s| s == scope);
    if has(s::ADMIN) {
        return None;
    }

    if is_in(method, PAIRING_METHODS) && !has(s::PAIRING) {
        return Some(ErrorShape::new(
            error_codes::NOT_ALLOWED,
            "missing scope: operator.pairing",
        ));
    }
    if is_in(method, READ_METHODS) && !(has(s::READ) || has(s::WRITE)) {
        return Some(ErrorShape::new(
            error_codes::NOT_ALLOWED,
            "missing scope: operator.read",
        ));
    }
    if is_in(method, WRITE_METHODS) && !has(s::WRITE) {
        return Some(ErrorShape::new(
            error_codes::NOT_ALLOWED,
            "missing scope: operator.write",
        ));
    }

    if is_in(method, PAIRING_METHODS) || is_in(method, READ_METHODS) || is_in(method, WRITE_METHODS)
    {
        return None;
    }

    Some(ErrorShape::new(
        error_codes::NOT_ALLOWED,
        "missing scope: operator.admin",
    ))
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.client_conn_id.clone();

        // Unknown methods are a request-shape problem, not an authorization
        // one, and never close the connection.
        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::invalid(format!("unknown method: {method}")),
            );
        };

        if let Some(err) = authorize_method(&method, &ctx.client_role, &ctx.client_scopes) {
            warn!(method, conn_id = %conn_id, code = %err.code, "method auth denied");
            return ResponseFrame::err(&request_id, err);
        }

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        channel::register(self);
        chat::register(self);
        gateway::register(self);
        node::register(self);
        pairing::register(self);
    }
}

/// Register a handler from an async fn.
macro_rules! method {
    ($registry:expr, $name:literal, $handler:path) => {
        $registry.register(
            $name,
            Box::new(move |ctx| {
                Box::pin($handler(ctx))
                    as std::pin::Pin<
                        Box<dyn std::future::Future<Output = crate::methods::MethodResult> + Send>,
                    >
            }),
        )
    };
}
pub(crate) use method;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn scopes(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn read_methods_require_read_scope() {
        for method in &["health", "status", "channels.status", "node.list", "chat.history"] {
            assert!(
                authorize_method(method, "operator", &scopes(&["operator.read"])).is_none(),
                "read scope should authorize {method}"
            );
            assert!(
                authorize_method(method, "operator", &scopes(&[])).is_some(),
                "no scope should deny {method}"
            );
        }
    }

    #[test]
    fn write_methods_require_write_scope() {
        for method in &["chat.send", "chat.abort", "node.invoke", "channels.start"] {
            assert!(
                authorize_method(method, "operator", &scopes(&["operator.write"])).is_none(),
                "write scope should authorize {method}"
            );
            assert!(
                authorize_method(method, "operator", &scopes(&["operator.read"])).is_some(),
                "read-only scope should deny {method}"
            );
        }
    }

    #[test]
    fn write_scope_grants_read_methods() {
        assert!(authorize_method("chat.history", "operator", &scopes(&["operator.write"])).is_none());
    }

    #[test]
    fn pairing_methods_require_pairing_scope() {
        for method in &["node.pair.approve", "node.pair.deny", "node.unpair", "node.rename"] {
            assert!(
                authorize_method(method, "operator", &scopes(&["operator.pairing"])).is_none(),
                "pairing scope should authorize {method}"
            );
            assert!(
                authorize_method(method, "operator", &scopes(&["operator.write"])).is_some(),
                "write scope should not authorize {method}"
            );
        }
    }

    #[test]
    fn admin_scope_authorizes_everything() {
        for method in &["health", "chat.send", "node.pair.approve", "channels.logout"] {
            assert!(authorize_method(method, "operator", &scopes(&["operator.admin"])).is_none());
        }
    }

    #[test]
    fn non_operator_role_is_denied() {
        let err = authorize_method("health", "node", &scopes(&["operator.admin"])).unwrap();
        assert_eq!(err.code, error_codes::NOT_ALLOWED);
    }

    #[test]
    fn unknown_method_without_admin_is_denied() {
        assert!(authorize_method("does.not.exist", "operator", &scopes(&["operator.write"])).is_some());
    }
}
