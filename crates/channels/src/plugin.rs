use {anyhow::Result, async_trait::async_trait, tokio_util::sync::CancellationToken};

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "telegram", "discord").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Run one account until `cancel` fires. This is the account's whole
    /// lifetime: connect, serve, reconnect as needed. Returning `Err` marks
    /// the runtime as failed; returning `Ok` after cancellation is a clean
    /// stop.
    async fn run_account(
        &self,
        account_id: &str,
        settings: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Optional teardown adapter, invoked on explicit stop and logout.
    fn stopper(&self) -> Option<&dyn ChannelStop> {
        None
    }
}

/// Teardown hooks for plugins that hold external state beyond the run task.
#[async_trait]
pub trait ChannelStop: Send + Sync {
    async fn stop_account(&self, account_id: &str) -> Result<()>;

    /// Discard credentials in addition to stopping. Defaults to a plain stop.
    async fn logout_account(&self, account_id: &str) -> Result<()> {
        self.stop_account(account_id).await
    }
}
