//! Tollgate runner
//!
//! Drives task contracts through the tollgate pipeline: one implementer, a
//! local reviewer and a judge panel reached over HTTP, with every transition
//! checked by the circuit breakers and every accepted draft checkpointed in
//! git.

pub mod config;
pub mod orchestrator;
pub mod poll;
pub mod pool;
pub mod prompts;
pub mod vcs;
pub mod worker;

pub use config::RunnerConfig;
pub use orchestrator::{Orchestrator, StepOutcome};
pub use poll::{AdaptivePoll, WakeReason};
pub use vcs::{GitVcs, NoopVcs, VcsError, VersionControl};
pub use worker::{HttpWorker, Worker, WorkerError, WorkerRequest, WorkerResponse, WorkerRole};
