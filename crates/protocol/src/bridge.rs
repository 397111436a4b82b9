//! Node bridge wire protocol: newline-delimited JSON frames over TCP.
//!
//! Nodes are end-user devices, not operators, so this is a deliberately
//! narrower protocol than the gateway RPC surface. A connection either asks to
//! pair (`pair-request`) or authenticates with an issued token (`hello`); once
//! authenticated it only ever answers `invoke` frames.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Frames exchanged between the bridge listener and a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeFrame {
    /// Node → bridge: request pairing approval from an operator.
    #[serde(rename = "pair-request")]
    PairRequest(PairRequestFrame),
    /// Bridge → node: pairing request stored, awaiting operator decision.
    #[serde(rename = "pair-pending")]
    PairPending {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    /// Bridge → node: pairing approved; `token` is shown exactly once.
    #[serde(rename = "pair-ok")]
    PairOk { token: String },
    /// Node → bridge: authenticate a (re)connection with an issued token.
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "nodeId")]
        node_id: String,
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caps: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        commands: Option<Vec<String>>,
        /// Binaries the node discovered on its host.
        #[serde(skip_serializing_if = "Option::is_none")]
        bins: Option<Vec<String>>,
    },
    /// Bridge → node: token accepted, node is live.
    #[serde(rename = "hello-ok")]
    HelloOk,
    /// Bridge → node: run an approved command.
    #[serde(rename = "invoke")]
    Invoke {
        id: String,
        command: String,
        #[serde(rename = "paramsJSON")]
        params_json: String,
    },
    /// Node → bridge: correlated result of an `invoke`.
    #[serde(rename = "invoke-res")]
    InvokeRes {
        id: String,
        ok: bool,
        #[serde(rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
        payload_json: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Node → bridge: graceful disconnect; the bridge closes without treating
    /// it as an error.
    #[serde(rename = "bye")]
    Bye,
    /// Bridge → node: terminal protocol error, connection closes after this.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Body of a `pair-request` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequestFrame {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    #[serde(rename = "deviceFamily", skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(rename = "modelIdentifier", skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: std::collections::HashMap<String, bool>,
    /// Re-pair an already-known nodeId (lost token); bypasses the
    /// one-outstanding-request rule.
    #[serde(rename = "isRepair", default)]
    pub is_repair: bool,
}

impl BridgeFrame {
    /// Serialize to a single wire line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one wire line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Decode an `invoke-res` payload string into a JSON value.
pub fn decode_payload(payload_json: Option<&str>) -> Value {
    payload_json
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn pair_request_round_trips_kebab_tag() {
        let raw = r#"{"type":"pair-request","nodeId":"n1","platform":"ios","version":"2.1",
            "caps":["canvas"],"commands":["canvas.eval"]}"#;
        let frame = BridgeFrame::from_line(raw).unwrap();
        match &frame {
            BridgeFrame::PairRequest(req) => {
                assert_eq!(req.node_id, "n1");
                assert!(!req.is_repair);
                assert_eq!(req.commands, vec!["canvas.eval"]);
            },
            other => panic!("expected pair-request, got {other:?}"),
        }
        let line = frame.to_line().unwrap();
        assert!(line.starts_with(r#"{"type":"pair-request""#));
    }

    #[test]
    fn invoke_res_carries_payload_json_string() {
        let frame = BridgeFrame::InvokeRes {
            id: "i1".into(),
            ok: true,
            payload_json: Some(r#"{"pixels":42}"#.into()),
            error: None,
        };
        let line = frame.to_line().unwrap();
        assert!(line.contains(r#""payloadJSON":"{\"pixels\":42}""#));

        let decoded = decode_payload(Some(r#"{"pixels":42}"#));
        assert_eq!(decoded["pixels"], 42);
        assert_eq!(decode_payload(None), Value::Null);
        assert_eq!(decode_payload(Some("not json")), Value::Null);
    }

    #[test]
    fn hello_ok_is_bare() {
        assert_eq!(BridgeFrame::HelloOk.to_line().unwrap(), r#"{"type":"hello-ok"}"#);
    }
}
