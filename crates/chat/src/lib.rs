//! Chat run coordination: idempotent submission, streaming, abort, and
//! per-session completion ordering.

pub mod coordinator;
pub mod error;
pub mod runner;

pub use {
    coordinator::{AbortOutcome, ChatCoordinator, RunStatus, SendOutcome, WaitOutcome},
    error::{Error, Result},
    runner::{AgentRunner, ChatEvent, ChatEvents, RunHandle},
};
