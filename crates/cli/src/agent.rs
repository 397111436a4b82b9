//! Built-in development agent.
//!
//! Streams the reply back word by word so clients exercise the delta path
//! even without a real model behind the coordinator. Swap in a provider by
//! handing the coordinator a different [`AgentRunner`].

use std::time::Duration;

use tether_chat::{AgentRunner, RunHandle};

pub struct EchoAgent;

#[async_trait::async_trait]
impl AgentRunner for EchoAgent {
    async fn run(
        &self,
        _session_key: &str,
        message: &str,
        _history: Vec<serde_json::Value>,
        handle: RunHandle,
    ) -> tether_chat::Result<String> {
        let reply = format!("you said: {message}");
        for chunk in reply.split_inclusive(' ') {
            if handle.is_aborted() {
                break;
            }
            handle.delta(chunk).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(reply)
    }
}
