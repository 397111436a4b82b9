//! Per-account channel runtime lifecycle.
//!
//! The manager owns one supervised task per (channel, account). Runtime
//! failures are captured into the account's state and surfaced in snapshots;
//! they never tear down the gateway.

use std::{collections::HashMap, sync::Arc};

use {
    tether_common::unix_now_ms,
    tether_config::schema::ChannelConfig,
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::registry::ChannelRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

/// Point-in-time view of one account runtime. Serialized into status
/// responses and the connect snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSnapshot {
    pub channel: String,
    #[serde(rename = "accountId")]
    pub account_id: String,
    pub running: bool,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "disabledReason", skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(rename = "startedAtMs", skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(rename = "stoppedAtMs", skip_serializing_if = "Option::is_none")]
    pub stopped_at_ms: Option<u64>,
}

#[derive(Default)]
struct RuntimeEntry {
    running: bool,
    last_error: Option<String>,
    disabled_reason: Option<String>,
    started_at_ms: Option<u64>,
    stopped_at_ms: Option<u64>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

type RuntimeKey = (String, String);
type RuntimeMap = Arc<Mutex<HashMap<RuntimeKey, RuntimeEntry>>>;

/// Supervises channel account tasks and answers status queries.
pub struct ChannelManager {
    registry: ChannelRegistry,
    configs: HashMap<String, ChannelConfig>,
    runtimes: RuntimeMap,
}

impl ChannelManager {
    pub fn new(registry: ChannelRegistry, configs: HashMap<String, ChannelConfig>) -> Self {
        Self {
            registry,
            configs,
            runtimes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Accounts a channel would run: the configured account ids, or the
    /// implicit "default" account when none are named.
    fn resolve_accounts(&self, channel_id: &str) -> Vec<String> {
        let ids = self
            .configs
            .get(channel_id)
            .map(|c| c.account_ids())
            .unwrap_or_default();
        if ids.is_empty() {
            vec!["default".to_string()]
        } else {
            ids
        }
    }

    /// Start one account, or every enabled-and-configured account of the
    /// channel when `account_id` is `None`. Already-running accounts are left
    /// alone, so repeated starts are safe.
    pub async fn start_channel(
        &self,
        channel_id: &str,
        account_id: Option<&str>,
    ) -> Result<Vec<AccountSnapshot>, ManagerError> {
        let plugin = self
            .registry
            .get(channel_id)
            .ok_or_else(|| ManagerError::UnknownChannel(channel_id.to_string()))?;

        let accounts = match account_id {
            Some(id) => vec![id.to_string()],
            None => self.resolve_accounts(channel_id),
        };
        let mut runtimes = self.runtimes.lock().await;

        for account_id in &accounts {
            let key = (channel_id.to_string(), account_id.clone());
            let entry = runtimes.entry(key.clone()).or_default();
            if entry.running {
                continue;
            }

            let account_cfg = self
                .configs
                .get(channel_id)
                .and_then(|c| c.accounts.get(account_id));

            match account_cfg {
                Some(cfg) if !cfg.enabled => {
                    entry.disabled_reason = Some("disabled in config".to_string());
                    continue;
                },
                Some(cfg) if !cfg.configured() => {
                    entry.disabled_reason = Some("not configured".to_string());
                    continue;
                },
                None => {
                    entry.disabled_reason = Some("not configured".to_string());
                    continue;
                },
                Some(_) => {},
            }

            let settings = account_cfg
                .map(|c| c.settings.clone())
                .unwrap_or(serde_json::Value::Null);
            let cancel = CancellationToken::new();
            let task = {
                let plugin = plugin.clone();
                let runtimes = self.runtimes.clone();
                let key = key.clone();
                let cancel = cancel.clone();
                let account_id = account_id.clone();
                tokio::spawn(async move {
                    let result = plugin.run_account(&account_id, settings, cancel).await;
                    let mut runtimes = runtimes.lock().await;
                    if let Some(entry) = runtimes.get_mut(&key) {
                        entry.running = false;
                        entry.stopped_at_ms = Some(unix_now_ms());
                        if let Err(e) = result {
                            warn!(channel = %key.0, account_id = %key.1, error = %e, "channel account failed");
                            entry.last_error = Some(e.to_string());
                        }
                    }
                })
            };

            entry.running = true;
            entry.last_error = None;
            entry.disabled_reason = None;
            entry.started_at_ms = Some(unix_now_ms());
            entry.stopped_at_ms = None;
            entry.cancel = Some(cancel);
            entry.task = Some(task);
            info!(channel = channel_id, account_id, "channel account started");
        }

        Ok(self.snapshot_channel_locked(channel_id, &accounts, &runtimes))
    }

    /// Start all registered channels. Failures are recorded per account and
    /// never abort the remaining channels.
    pub async fn start_all(&self) {
        for channel_id in self.registry.list() {
            if let Err(e) = self.start_channel(&channel_id, None).await {
                warn!(channel = %channel_id, error = %e, "failed to start channel");
            }
        }
    }

    /// Stop one account, or every account of the channel when `account_id`
    /// is `None`. Waits for the run tasks to finish.
    pub async fn stop_channel(
        &self,
        channel_id: &str,
        account_id: Option<&str>,
    ) -> Result<Vec<AccountSnapshot>, ManagerError> {
        let plugin = self
            .registry
            .get(channel_id)
            .ok_or_else(|| ManagerError::UnknownChannel(channel_id.to_string()))?;

        let accounts = match account_id {
            Some(id) => vec![id.to_string()],
            None => self.resolve_accounts(channel_id),
        };

        // Collect the handles under the lock, await them outside it.
        let mut stopping: Vec<(String, JoinHandle<()>)> = Vec::new();
        {
            let mut runtimes = self.runtimes.lock().await;
            for account_id in &accounts {
                let key = (channel_id.to_string(), account_id.clone());
                if let Some(entry) = runtimes.get_mut(&key) {
                    if let Some(cancel) = entry.cancel.take() {
                        cancel.cancel();
                    }
                    if let Some(task) = entry.task.take() {
                        stopping.push((account_id.clone(), task));
                    }
                }
            }
        }

        for (account_id, task) in stopping {
            if let Some(stop) = plugin.stopper()
                && let Err(e) = stop.stop_account(&account_id).await
            {
                warn!(channel = channel_id, account_id, error = %e, "stop hook failed");
            }
            if task.await.is_err() {
                warn!(channel = channel_id, account_id, "channel task panicked");
            }
            info!(channel = channel_id, account_id, "channel account stopped");
        }

        let runtimes = self.runtimes.lock().await;
        Ok(self.snapshot_channel_locked(channel_id, &accounts, &runtimes))
    }

    /// Stop an account and invoke the plugin's logout hook so credentials are
    /// discarded. The account stays down until explicitly restarted.
    pub async fn logout(
        &self,
        channel_id: &str,
        account_id: &str,
    ) -> Result<AccountSnapshot, ManagerError> {
        let plugin = self
            .registry
            .get(channel_id)
            .ok_or_else(|| ManagerError::UnknownChannel(channel_id.to_string()))?;

        self.stop_channel(channel_id, Some(account_id)).await?;

        if let Some(stop) = plugin.stopper()
            && let Err(e) = stop.logout_account(account_id).await
        {
            warn!(channel = channel_id, account_id, error = %e, "logout hook failed");
        }

        let mut runtimes = self.runtimes.lock().await;
        let key = (channel_id.to_string(), account_id.to_string());
        let entry = runtimes
            .get_mut(&key)
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        entry.disabled_reason = Some("logged out".to_string());
        entry.last_error = None;
        info!(channel = channel_id, account_id, "channel account logged out");

        Ok(snapshot_of(channel_id, account_id, entry))
    }

    /// Point-in-time view of every account of every registered channel.
    /// Read-only: accounts that never started appear with default state.
    pub async fn snapshot(&self) -> Vec<AccountSnapshot> {
        let runtimes = self.runtimes.lock().await;
        let mut out = Vec::new();
        for channel_id in self.registry.list() {
            let accounts = self.resolve_accounts(&channel_id);
            out.extend(self.snapshot_channel_locked(&channel_id, &accounts, &runtimes));
        }
        out
    }

    fn snapshot_channel_locked(
        &self,
        channel_id: &str,
        accounts: &[String],
        runtimes: &HashMap<RuntimeKey, RuntimeEntry>,
    ) -> Vec<AccountSnapshot> {
        accounts
            .iter()
            .map(|account_id| {
                let key = (channel_id.to_string(), account_id.clone());
                match runtimes.get(&key) {
                    Some(entry) => snapshot_of(channel_id, account_id, entry),
                    None => AccountSnapshot {
                        channel: channel_id.to_string(),
                        account_id: account_id.clone(),
                        running: false,
                        last_error: None,
                        disabled_reason: None,
                        started_at_ms: None,
                        stopped_at_ms: None,
                    },
                }
            })
            .collect()
    }
}

fn snapshot_of(channel_id: &str, account_id: &str, entry: &RuntimeEntry) -> AccountSnapshot {
    AccountSnapshot {
        channel: channel_id.to_string(),
        account_id: account_id.to_string(),
        running: entry.running,
        last_error: entry.last_error.clone(),
        disabled_reason: entry.disabled_reason.clone(),
        started_at_ms: entry.started_at_ms,
        stopped_at_ms: entry.stopped_at_ms,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::plugin::ChannelPlugin,
        async_trait::async_trait,
        std::collections::HashMap,
        tether_config::schema::AccountConfig,
    };

    struct WaitPlugin {
        id: String,
        fail: bool,
    }

    #[async_trait]
    impl ChannelPlugin for WaitPlugin {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            "Wait"
        }

        async fn run_account(
            &self,
            _account_id: &str,
            _settings: serde_json::Value,
            cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("boom");
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn configs(channel: &str, enabled: bool) -> HashMap<String, ChannelConfig> {
        let mut accounts = HashMap::new();
        accounts.insert("default".to_string(), AccountConfig {
            enabled,
            settings: serde_json::json!({"token": "t"}),
        });
        let mut map = HashMap::new();
        map.insert(channel.to_string(), ChannelConfig { accounts });
        map
    }

    fn named_configs(channel: &str, names: &[&str]) -> HashMap<String, ChannelConfig> {
        let mut accounts = HashMap::new();
        for name in names {
            accounts.insert(name.to_string(), AccountConfig {
                enabled: true,
                settings: serde_json::json!({"token": "t"}),
            });
        }
        let mut map = HashMap::new();
        map.insert(channel.to_string(), ChannelConfig { accounts });
        map
    }

    fn manager(fail: bool, enabled: bool) -> ChannelManager {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(WaitPlugin {
            id: "demo".into(),
            fail,
        }));
        ChannelManager::new(registry, configs("demo", enabled))
    }

    #[tokio::test]
    async fn start_and_stop_account() {
        let mgr = manager(false, true);

        let snaps = mgr.start_channel("demo", None).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].running);

        let snaps = mgr.stop_channel("demo", None).await.unwrap();
        assert!(!snaps[0].running);
        assert!(snaps[0].last_error.is_none());
    }

    #[tokio::test]
    async fn task_failure_is_recorded_not_raised() {
        let mgr = manager(true, true);

        mgr.start_channel("demo", None).await.unwrap();
        // The failing task finishes on its own; wait for its state write.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snaps = mgr.snapshot().await;
        assert!(!snaps[0].running);
        assert_eq!(snaps[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn disabled_account_is_skipped_with_reason() {
        let mgr = manager(false, false);

        let snaps = mgr.start_channel("demo", None).await.unwrap();
        assert!(!snaps[0].running);
        assert_eq!(snaps[0].disabled_reason.as_deref(), Some("disabled in config"));
    }

    #[tokio::test]
    async fn unconfigured_account_is_skipped_with_reason() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(WaitPlugin {
            id: "demo".into(),
            fail: false,
        }));
        let mgr = ChannelManager::new(registry, HashMap::new());

        let snaps = mgr.start_channel("demo", None).await.unwrap();
        assert_eq!(snaps[0].account_id, "default");
        assert_eq!(snaps[0].disabled_reason.as_deref(), Some("not configured"));
    }

    #[tokio::test]
    async fn double_start_is_idempotent() {
        let mgr = manager(false, true);

        mgr.start_channel("demo", None).await.unwrap();
        let snaps = mgr.start_channel("demo", None).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].running);

        mgr.stop_channel("demo", None).await.unwrap();
    }

    #[tokio::test]
    async fn configured_accounts_override_implicit_default() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(WaitPlugin {
            id: "demo".into(),
            fail: false,
        }));
        let mgr = ChannelManager::new(registry, named_configs("demo", &["work", "alt"]));

        // Named accounts in the config win; the implicit "default" account
        // must not start alongside them.
        let snaps = mgr.start_channel("demo", None).await.unwrap();
        let accounts: Vec<&str> = snaps.iter().map(|s| s.account_id.as_str()).collect();
        assert_eq!(accounts, vec!["alt", "work"]);
        assert!(snaps.iter().all(|s| s.running));

        mgr.stop_channel("demo", None).await.unwrap();
    }

    #[tokio::test]
    async fn single_account_start_leaves_others_stopped() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(WaitPlugin {
            id: "demo".into(),
            fail: false,
        }));
        let mgr = ChannelManager::new(registry, named_configs("demo", &["work", "alt"]));

        let snaps = mgr.start_channel("demo", Some("work")).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].account_id, "work");
        assert!(snaps[0].running);

        let all = mgr.snapshot().await;
        let alt = all.iter().find(|s| s.account_id == "alt").unwrap();
        assert!(!alt.running);

        mgr.stop_channel("demo", None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let mgr = manager(false, true);
        assert!(matches!(
            mgr.start_channel("nope", None).await,
            Err(ManagerError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn logout_marks_account() {
        let mgr = manager(false, true);

        mgr.start_channel("demo", None).await.unwrap();
        let snap = mgr.logout("demo", "default").await.unwrap();
        assert!(!snap.running);
        assert_eq!(snap.disabled_reason.as_deref(), Some("logged out"));
    }
}
