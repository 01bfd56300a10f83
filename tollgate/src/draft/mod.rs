//! Draft-and-gate protocol.
//!
//! Workers stage drafts in the sandbox; [`DraftGate`] decides whether each one
//! reaches the workspace.

pub mod diff;
pub mod gate;
pub mod scan;

pub use diff::{DiffOp, DiffSummary, LineDiff};
pub use gate::{
    artifact_hash, artifact_names, AppliedDrafts, ApplyOutcome, Decision, DraftGate,
    DraftSubmission, GateDecision, ProcessOutcome,
};
pub use scan::{SafetyScanner, ScanCategory, ScanFinding};
