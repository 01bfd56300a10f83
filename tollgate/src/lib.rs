//! Tollgate core library
//!
//! Durable task contracts, an explicit transition table, nine circuit-breaker
//! predicates and a sandboxed draft gate. Together they guarantee that no
//! worker-produced change reaches the workspace without passing an auditable
//! safety check.
//!
//! # Components
//!
//! - [`sandbox::SandboxValidator`]: path validation for worker writes and reads
//! - [`audit::AuditLog`]: append-only `transitions.jsonl` with replay checks
//! - [`contract::ContractStore`]: versioned, lockable task records and archive
//! - [`state_machine`]: the transition table, the only place status changes
//! - [`breaker::CircuitBreakerEvaluator`]: safety predicates run after every phase
//! - [`draft::DraftGate`]: diff, scan and atomic apply of staged drafts
//! - [`halt::HaltReport`]: structured report for every halted task
//!
//! The orchestrator loop, worker connection and git integration live in the
//! `tollgate-runner` crate.

pub mod audit;
pub mod breaker;
pub mod config;
pub mod contract;
pub mod draft;
pub mod error;
pub mod fsutil;
pub mod halt;
pub mod sandbox;
pub mod state_machine;

pub use audit::{AuditLog, ReplayMismatch, ReplayReport, TransitionLogEntry};
pub use breaker::{
    Advance, BreakerInput, BreakerTrigger, BreakerTrip, CircuitBreakerEvaluator,
    FindingClassifier, SeverityClassifier,
};
pub use config::GateConfig;
pub use contract::{ContractStore, TaskContract, TaskProposal, TaskStatus};
pub use draft::{Decision, DraftGate, DraftSubmission, GateDecision};
pub use error::{GateError, GateResult, StructuredError};
pub use halt::{HaltReport, HaltTrigger};
pub use sandbox::{PathCheck, SandboxValidator};
pub use state_machine::{apply_event, transition, TaskEvent};
