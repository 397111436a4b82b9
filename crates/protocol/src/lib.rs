//! Gateway WebSocket/RPC protocol definitions.
//!
//! Protocol version 1. All communication uses JSON frames over WebSocket.
//!
//! Frame types:
//! - `RequestFrame`  — client → gateway RPC call
//! - `ResponseFrame` — gateway → client RPC result
//! - `EventFrame`    — gateway → client server-push
//!
//! The node bridge speaks a separate newline-delimited JSON protocol; its
//! frames live in [`bridge`].

use serde::{Deserialize, Serialize};

pub mod bridge;

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s per connect attempt
pub const CLOCK_SKEW_MS: u64 = 600_000; // 10 min signedAt window
pub const RUN_RETENTION_MS: u64 = 300_000; // 5 min terminal-run retention
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000; // 30s
pub const HISTORY_MAX_BYTES: usize = 262_144; // 256 KB per chat.history response
pub const HISTORY_MAX_MESSAGES: usize = 500;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const NOT_ALLOWED: &str = "NOT_ALLOWED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(error_codes::UNAUTHORIZED, message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
        }
    }
}

/// Discriminated union of all frame types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrameInner),
    #[serde(rename = "res")]
    Response(ResponseFrameInner),
    #[serde(rename = "event")]
    Event(EventFrameInner),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrameInner {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrameInner {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrameInner {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    pub device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Device-identity proof carried in the connect request. The signature covers
/// the payload rebuilt server-side from these fields plus the client fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "signedAt")]
    pub signed_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOk {
    /// Negotiated protocol version, within the client's `[min, max]` window.
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    /// Initial state snapshot: channel runtimes, pairing lists, node presence.
    pub snapshot: serde_json::Value,
    pub auth: ConnectAuthResult,
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuthResult {
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(rename = "issuedAtMs")]
    pub issued_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Policy {
    pub fn default_policy() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

// ── Roles and scopes ─────────────────────────────────────────────────────────

pub mod roles {
    pub const OPERATOR: &str = "operator";
    pub const NODE: &str = "node";
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
    pub const PAIRING: &str = "operator.pairing";
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_parses_from_tagged_union() {
        let raw = r#"{"type":"req","id":"r1","method":"chat.send","params":{"message":"hi"}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).expect("parse");
        match frame {
            GatewayFrame::Request(req) => {
                assert_eq!(req.id, "r1");
                assert_eq!(req.method, "chat.send");
                assert_eq!(req.params.expect("params")["message"], "hi");
            },
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn response_frame_omits_absent_fields() {
        let ok = ResponseFrame::ok("r2", serde_json::json!({"done": true}));
        let raw = serde_json::to_string(&ok).expect("serialize");
        assert!(raw.contains(r#""ok":true"#));
        assert!(!raw.contains("error"));

        let err = ResponseFrame::err("r3", ErrorShape::invalid("bad params"));
        let raw = serde_json::to_string(&err).expect("serialize");
        assert!(raw.contains(r#""code":"INVALID_REQUEST""#));
        assert!(!raw.contains("payload"));
    }

    #[test]
    fn connect_params_accept_camel_case_wire_names() {
        let raw = r#"{
            "minProtocol": 1,
            "maxProtocol": 1,
            "client": {"id":"cli-1","version":"0.3.0","platform":"linux","mode":"operator"},
            "device": {"id":"d1","publicKey":"pk","signature":"sig","signedAt": 1700000000000},
            "auth": {"token":"tok_test_123"}
        }"#;
        let params: ConnectParams = serde_json::from_str(raw).expect("parse");
        assert_eq!(params.min_protocol, 1);
        assert_eq!(params.device.signed_at, 1_700_000_000_000);
        assert_eq!(params.auth.and_then(|a| a.token).as_deref(), Some("tok_test_123"));
    }
}
