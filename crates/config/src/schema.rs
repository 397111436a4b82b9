//! Config schema types (gateway, bridge, auth, channels, chat).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub gateway: GatewayConfig,
    pub bridge: BridgeConfig,
    pub auth: AuthConfig,
    pub channels: HashMap<String, ChannelConfig>,
    pub chat: ChatConfig,
}

/// Gateway WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind to.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18789,
        }
    }
}

/// Node bridge listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
        }
    }
}

/// Connect-handshake authentication. When neither field is set, connections
/// are accepted on the device signature alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared token clients must present in `auth.token`.
    pub token: Option<String>,
    /// Password alternative to the token.
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn required(&self) -> bool {
        self.token.is_some() || self.password.is_some()
    }
}

/// Per-channel configuration: a set of named accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub accounts: HashMap<String, AccountConfig>,
}

impl ChannelConfig {
    /// Account ids declared in config, sorted for stable iteration.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.accounts.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// One channel account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub enabled: bool,
    /// Opaque plugin-specific settings passed to `start_account`.
    pub settings: serde_json::Value,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: serde_json::Value::Object(Default::default()),
        }
    }
}

impl AccountConfig {
    /// An account with an empty settings object is declared but unconfigured.
    pub fn configured(&self) -> bool {
        self.settings
            .as_object()
            .is_none_or(|o| !o.is_empty())
    }
}

/// Chat run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Per-run agent timeout in seconds. Distinct from transport timeouts.
    pub agent_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 600,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: TetherConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.gateway.port, 18789);
        assert_eq!(cfg.bridge.port, 18790);
        assert!(!cfg.auth.required());
    }

    #[test]
    fn channel_accounts_parse_from_toml() {
        let cfg: TetherConfig = toml::from_str(
            r#"
            [auth]
            token = "tok_test_123"

            [channels.telegram.accounts.work]
            enabled = true

            [channels.telegram.accounts.work.settings]
            bot_token = "abc"

            [channels.telegram.accounts.alt]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(cfg.auth.required());
        let tg = cfg.channels.get("telegram").unwrap();
        assert_eq!(tg.account_ids(), vec!["alt", "work"]);
        assert!(tg.accounts["work"].configured());
        assert!(!tg.accounts["alt"].enabled);
        assert!(!tg.accounts["alt"].configured());
    }
}
