//! Traits at the coordinator's seams.
//!
//! `AgentRunner` is the agent backend that actually produces a reply;
//! `ChatEvents` is the broadcast sink the gateway implements. Both are traits
//! so the coordinator compiles without a gateway dependency and tests can
//! supply scripted fakes.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_json::Value;

/// Events the coordinator emits while a run progresses. The gateway turns
/// these into `chat.delta` / `chat.final` / `chat.aborted` broadcast frames.
/// An aborted run never produces a `Final`; `Aborted` is its only terminal
/// event.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChatEvent {
    Delta {
        #[serde(rename = "runId")]
        run_id: String,
        text: String,
    },
    Final {
        #[serde(rename = "runId")]
        run_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Aborted {
        #[serde(rename = "runId")]
        run_id: String,
    },
}

#[async_trait::async_trait]
pub trait ChatEvents: Send + Sync {
    async fn emit(&self, session_key: &str, event: ChatEvent);
}

/// Handed to the runner for streaming output and abort checks. Deltas go
/// through here so post-abort suppression happens in one place.
pub struct RunHandle {
    pub(crate) run_id: String,
    pub(crate) session_key: String,
    pub(crate) aborted: Arc<AtomicBool>,
    pub(crate) events: Arc<dyn ChatEvents>,
}

impl RunHandle {
    /// Build a handle not attached to a coordinator run, for driving a
    /// runner directly.
    pub fn detached(
        run_id: impl Into<String>,
        session_key: impl Into<String>,
        events: Arc<dyn ChatEvents>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_key: session_key.into(),
            aborted: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Stream a chunk of agent output. Dropped silently once the run is
    /// aborted.
    pub async fn delta(&self, text: &str) {
        if self.is_aborted() {
            return;
        }
        self.events
            .emit(&self.session_key, ChatEvent::Delta {
                run_id: self.run_id.clone(),
                text: text.to_string(),
            })
            .await;
    }
}

/// The agent backend. One call per run; the returned string is the final
/// reply text.
#[async_trait::async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        session_key: &str,
        message: &str,
        history: Vec<Value>,
        handle: RunHandle,
    ) -> crate::error::Result<String>;
}
