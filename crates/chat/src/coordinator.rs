//! The chat run coordinator.
//!
//! Each run is keyed by (session, idempotency key): resubmitting the same key
//! replays the existing run instead of starting a second one. Runs within one
//! session execute on a per-session queue, so completions broadcast in
//! submission order. Aborting a run suppresses any further deltas and its
//! final; a distinct `aborted` event goes out instead.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tether_common::unix_now_ms,
    tether_protocol::{HISTORY_MAX_BYTES, HISTORY_MAX_MESSAGES, RUN_RETENTION_MS},
    tether_sessions::SessionStore,
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Context, Error, Result},
    runner::{AgentRunner, ChatEvent, ChatEvents, RunHandle},
};

// ── Run state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    InFlight,
    Ok,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InFlight => "in_flight",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Aborted)
    }
}

struct RunShared {
    run_id: String,
    session_key: String,
    aborted: Arc<AtomicBool>,
    final_emitted: AtomicBool,
    cancel: CancellationToken,
    status: watch::Sender<RunStatus>,
    /// 0 while the run is live.
    finished_at_ms: AtomicU64,
}

impl RunShared {
    fn current_status(&self) -> RunStatus {
        *self.status.borrow()
    }

    fn is_terminal(&self) -> bool {
        self.current_status().is_terminal()
    }
}

enum RunOutcome {
    Ok(String),
    Error(String),
    Aborted,
}

struct QueuedRun {
    shared: Arc<RunShared>,
    message: String,
}

#[derive(Default)]
struct RunTable {
    by_key: HashMap<(String, String), Arc<RunShared>>,
    by_id: HashMap<String, Arc<RunShared>>,
}

// ── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SendOutcome {
    /// A run (new or replayed) is associated with this submission.
    Run {
        run_id: String,
        status: RunStatus,
        replayed: bool,
    },
    /// The message was a stop command; no run was started.
    Stopped { aborted: Vec<String> },
}

#[derive(Debug)]
pub struct AbortOutcome {
    pub aborted: Vec<String>,
}

#[derive(Debug)]
pub struct WaitOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub timed_out: bool,
}

// ── Coordinator ─────────────────────────────────────────────────────────────

struct Inner {
    runner: Arc<dyn AgentRunner>,
    events: Arc<dyn ChatEvents>,
    store: Arc<SessionStore>,
    agent_timeout: Duration,
    retention: Duration,
    table: StdMutex<RunTable>,
    queues: StdMutex<HashMap<String, mpsc::UnboundedSender<QueuedRun>>>,
}

pub struct ChatCoordinator {
    inner: Arc<Inner>,
}

impl ChatCoordinator {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        events: Arc<dyn ChatEvents>,
        store: Arc<SessionStore>,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                events,
                store,
                agent_timeout,
                retention: Duration::from_millis(RUN_RETENTION_MS),
                table: StdMutex::new(RunTable::default()),
                queues: StdMutex::new(HashMap::new()),
            }),
        }
    }

    #[cfg(test)]
    fn with_retention(mut self, retention: Duration) -> Self {
        // Only reachable before the coordinator is shared.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retention = retention;
        }
        self
    }

    /// Submit a message. Duplicate (session, idempotency key) pairs replay
    /// the original run. A bare `/stop` aborts the session's active runs
    /// instead of starting a new one.
    pub async fn send(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<SendOutcome> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(Error::message("empty message"));
        }
        if trimmed == "/stop" {
            let outcome = self.abort(session_key, None)?;
            return Ok(SendOutcome::Stopped {
                aborted: outcome.aborted,
            });
        }

        let key = (session_key.to_string(), idempotency_key.to_string());
        let shared = {
            let mut table = self.inner.table.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = table.by_key.get(&key) {
                return Ok(SendOutcome::Run {
                    run_id: existing.run_id.clone(),
                    status: existing.current_status(),
                    replayed: true,
                });
            }

            let (status_tx, _) = watch::channel(RunStatus::Started);
            let shared = Arc::new(RunShared {
                run_id: uuid::Uuid::new_v4().to_string(),
                session_key: session_key.to_string(),
                aborted: Arc::new(AtomicBool::new(false)),
                final_emitted: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                status: status_tx,
                finished_at_ms: AtomicU64::new(0),
            });
            table.by_key.insert(key, shared.clone());
            table.by_id.insert(shared.run_id.clone(), shared.clone());
            shared
        };

        self.inner
            .store
            .append(
                session_key,
                &serde_json::json!({
                    "role": "user",
                    "content": trimmed,
                    "runId": shared.run_id,
                    "ts": unix_now_ms(),
                }),
            )
            .await
            .context("persist user message")?;

        let run_id = shared.run_id.clone();
        self.enqueue(session_key, QueuedRun {
            shared,
            message: trimmed.to_string(),
        });
        info!(session = session_key, run_id = %run_id, "chat run queued");

        Ok(SendOutcome::Run {
            run_id,
            status: RunStatus::Started,
            replayed: false,
        })
    }

    /// Abort one run, or every live run of the session when `run_id` is
    /// `None`. Unknown or already-finished runs abort nothing; a run id from
    /// a different session is rejected.
    pub fn abort(&self, session_key: &str, run_id: Option<&str>) -> Result<AbortOutcome> {
        let table = self.inner.table.lock().unwrap_or_else(|p| p.into_inner());
        let targets: Vec<Arc<RunShared>> = match run_id {
            Some(id) => match table.by_id.get(id) {
                Some(shared) if shared.session_key != session_key => {
                    return Err(Error::WrongSession);
                },
                Some(shared) => vec![shared.clone()],
                None => vec![],
            },
            None => table
                .by_id
                .values()
                .filter(|s| s.session_key == session_key)
                .cloned()
                .collect(),
        };
        drop(table);

        let mut aborted = Vec::new();
        for shared in targets {
            if shared.is_terminal() {
                continue;
            }
            shared.aborted.store(true, Ordering::SeqCst);
            shared.cancel.cancel();
            aborted.push(shared.run_id.clone());
            info!(session = session_key, run_id = %shared.run_id, "chat run aborted");
        }
        Ok(AbortOutcome { aborted })
    }

    /// Block until the run reaches a terminal status, or `timeout` elapses.
    pub async fn wait(
        &self,
        session_key: &str,
        run_id: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        let shared = {
            let table = self.inner.table.lock().unwrap_or_else(|p| p.into_inner());
            match table.by_id.get(run_id) {
                Some(shared) if shared.session_key != session_key => {
                    return Err(Error::WrongSession);
                },
                Some(shared) => shared.clone(),
                None => return Err(Error::UnknownRun),
            }
        };

        let mut rx = shared.status.subscribe();
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal())).await;
        let timed_out = waited.is_err();
        Ok(WaitOutcome {
            run_id: run_id.to_string(),
            status: shared.current_status(),
            timed_out,
        })
    }

    /// Transcript tail, bounded by the history caps. A caller `limit` can
    /// lower the message count but never raise it past the ceiling.
    pub async fn history(
        &self,
        session_key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<serde_json::Value>> {
        let max_messages = limit
            .unwrap_or(HISTORY_MAX_MESSAGES)
            .min(HISTORY_MAX_MESSAGES);
        self.inner
            .store
            .tail_capped(session_key, max_messages, HISTORY_MAX_BYTES)
            .await
            .context("read transcript")
    }

    /// Current status of a run, if the id is still tracked.
    pub fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        let table = self.inner.table.lock().unwrap_or_else(|p| p.into_inner());
        table.by_id.get(run_id).map(|s| s.current_status())
    }

    /// Drop terminal runs past the retention window. Idempotency keys stay
    /// effective for the lifetime of the record, so retention bounds the
    /// replay window.
    pub fn gc(&self) {
        let now = unix_now_ms();
        let retention = self.inner.retention.as_millis() as u64;
        let mut table = self.inner.table.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<String> = table
            .by_id
            .values()
            .filter(|s| {
                let finished = s.finished_at_ms.load(Ordering::SeqCst);
                finished > 0 && now.saturating_sub(finished) > retention
            })
            .map(|s| s.run_id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        table.by_id.retain(|id, _| !expired.contains(id));
        table
            .by_key
            .retain(|_, shared| !expired.contains(&shared.run_id));
        debug!(count = expired.len(), "chat runs expired");
    }

    fn enqueue(&self, session_key: &str, run: QueuedRun) {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|p| p.into_inner());
        let tx = queues.entry(session_key.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel::<QueuedRun>();
            tokio::spawn(Inner::session_worker(
                self.inner.clone(),
                session_key.to_string(),
                rx,
            ));
            tx
        });
        if tx.send(run).is_err() {
            warn!(session = session_key, "chat queue worker gone");
        }
    }

    /// Sessions with a live queue worker.
    #[cfg(test)]
    fn queued_sessions(&self) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

impl Inner {
    /// Drain one session's queue in FIFO order, then remove its entry and
    /// exit. The emptiness check and the removal happen under the `queues`
    /// lock, and `enqueue` inserts and sends under the same lock, so a run
    /// can never land on a worker that has decided to exit.
    async fn session_worker(
        inner: Arc<Inner>,
        session_key: String,
        mut rx: mpsc::UnboundedReceiver<QueuedRun>,
    ) {
        loop {
            let next = {
                let mut queues = inner.queues.lock().unwrap_or_else(|p| p.into_inner());
                match rx.try_recv() {
                    Ok(run) => Some(run),
                    Err(_) => {
                        queues.remove(&session_key);
                        None
                    },
                }
            };
            let Some(run) = next else { break };
            Self::process(&inner, run).await;
        }
    }

    /// Execute one run on the session queue. The queue is what guarantees
    /// finals go out in submission order.
    async fn process(inner: &Arc<Inner>, run: QueuedRun) {
        let shared = run.shared;

        if shared.aborted.load(Ordering::SeqCst) {
            Self::finish(inner, &shared, RunOutcome::Aborted).await;
            return;
        }

        let _ = shared.status.send(RunStatus::InFlight);

        let history = inner
            .store
            .tail_capped(&shared.session_key, HISTORY_MAX_MESSAGES, HISTORY_MAX_BYTES)
            .await
            .unwrap_or_default();

        let handle = RunHandle {
            run_id: shared.run_id.clone(),
            session_key: shared.session_key.clone(),
            aborted: shared.aborted.clone(),
            events: inner.events.clone(),
        };

        let outcome = tokio::select! {
            () = shared.cancel.cancelled() => RunOutcome::Aborted,
            result = tokio::time::timeout(
                inner.agent_timeout,
                inner.runner.run(&shared.session_key, &run.message, history, handle),
            ) => match result {
                Ok(Ok(text)) => RunOutcome::Ok(text),
                Ok(Err(e)) => RunOutcome::Error(e.to_string()),
                Err(_) => RunOutcome::Error("agent timed out".to_string()),
            },
        };

        Self::finish(inner, &shared, outcome).await;
    }

    async fn finish(inner: &Arc<Inner>, shared: &Arc<RunShared>, outcome: RunOutcome) {
        // An abort that raced the runner's completion still wins.
        let outcome = if shared.aborted.load(Ordering::SeqCst) {
            RunOutcome::Aborted
        } else {
            outcome
        };

        if shared.final_emitted.swap(true, Ordering::SeqCst) {
            return;
        }

        let (status, event) = match outcome {
            RunOutcome::Ok(text) => {
                if let Err(e) = inner
                    .store
                    .append(
                        &shared.session_key,
                        &serde_json::json!({
                            "role": "assistant",
                            "content": text,
                            "runId": shared.run_id,
                            "ts": unix_now_ms(),
                        }),
                    )
                    .await
                {
                    warn!(session = %shared.session_key, error = %e, "failed to persist reply");
                }
                (RunStatus::Ok, ChatEvent::Final {
                    run_id: shared.run_id.clone(),
                    status: RunStatus::Ok.as_str().to_string(),
                    text: Some(text),
                    error: None,
                })
            },
            RunOutcome::Error(message) => (RunStatus::Error, ChatEvent::Final {
                run_id: shared.run_id.clone(),
                status: RunStatus::Error.as_str().to_string(),
                text: None,
                error: Some(message),
            }),
            RunOutcome::Aborted => (RunStatus::Aborted, ChatEvent::Aborted {
                run_id: shared.run_id.clone(),
            }),
        };

        shared.finished_at_ms.store(unix_now_ms(), Ordering::SeqCst);
        let _ = shared.status.send(status);
        inner.events.emit(&shared.session_key, event).await;
    }
}
