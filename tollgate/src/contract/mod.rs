//! Task contracts and their durable store.

pub mod store;
pub mod types;

pub use store::ContractStore;
pub use types::{
    BreakerState, BreakerStatus, Complexity, Constraints, CycleFindings, Finding,
    FindingSeverity, HandoffData, JudgeVerdict, Limits, LocalVerdict, ModelTier, Phase,
    PhaseTimeouts, ReviewSource, SourceArtifact, Specification, TaskContract, TaskLock,
    TaskProposal, TaskStatus, TransitionSummary,
};
