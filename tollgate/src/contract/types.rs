//! Task contract data model.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerTrigger;
use crate::draft::DiffSummary;
use crate::fsutil::sanitize_task_id;
use crate::state_machine::TaskEvent;

// ============================================================================
// Status and phase
// ============================================================================

/// Every status a task can be in. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingImplementer,
    ImplementationInProgress,
    PendingLocalReview,
    LocalReviewInProgress,
    PendingJudgeReview,
    JudgeReviewInProgress,
    ReviewComplete,
    PendingRebuttal,
    RebuttalInProgress,
    /// Terminal success.
    Merged,
    /// Terminal until a human resets the task.
    ErikConsultation,
    TimeoutImplementation,
    TimeoutLocalReview,
    TimeoutJudgeReview,
    TimeoutRebuttal,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 15] = [
        Self::PendingImplementer,
        Self::ImplementationInProgress,
        Self::PendingLocalReview,
        Self::LocalReviewInProgress,
        Self::PendingJudgeReview,
        Self::JudgeReviewInProgress,
        Self::ReviewComplete,
        Self::PendingRebuttal,
        Self::RebuttalInProgress,
        Self::Merged,
        Self::ErikConsultation,
        Self::TimeoutImplementation,
        Self::TimeoutLocalReview,
        Self::TimeoutJudgeReview,
        Self::TimeoutRebuttal,
    ];

    /// `merged` and `erik_consultation` end an attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::ErikConsultation)
    }

    /// Whether a worker call is outstanding in this status.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::ImplementationInProgress
                | Self::LocalReviewInProgress
                | Self::JudgeReviewInProgress
                | Self::RebuttalInProgress
        )
    }

    /// The work phase this status belongs to, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::PendingImplementer
            | Self::ImplementationInProgress
            | Self::TimeoutImplementation => Some(Phase::Implementation),
            Self::PendingLocalReview | Self::LocalReviewInProgress | Self::TimeoutLocalReview => {
                Some(Phase::LocalReview)
            }
            Self::PendingJudgeReview | Self::JudgeReviewInProgress | Self::TimeoutJudgeReview => {
                Some(Phase::JudgeReview)
            }
            Self::PendingRebuttal | Self::RebuttalInProgress | Self::TimeoutRebuttal => {
                Some(Phase::Rebuttal)
            }
            Self::ReviewComplete | Self::Merged | Self::ErikConsultation => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingImplementer => "pending_implementer",
            Self::ImplementationInProgress => "implementation_in_progress",
            Self::PendingLocalReview => "pending_local_review",
            Self::LocalReviewInProgress => "local_review_in_progress",
            Self::PendingJudgeReview => "pending_judge_review",
            Self::JudgeReviewInProgress => "judge_review_in_progress",
            Self::ReviewComplete => "review_complete",
            Self::PendingRebuttal => "pending_rebuttal",
            Self::RebuttalInProgress => "rebuttal_in_progress",
            Self::Merged => "merged",
            Self::ErikConsultation => "erik_consultation",
            Self::TimeoutImplementation => "timeout_implementation",
            Self::TimeoutLocalReview => "timeout_local_review",
            Self::TimeoutJudgeReview => "timeout_judge_review",
            Self::TimeoutRebuttal => "timeout_rebuttal",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work phase, each with its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Implementation,
    LocalReview,
    JudgeReview,
    Rebuttal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Implementation => write!(f, "implementation"),
            Self::LocalReview => write!(f, "local_review"),
            Self::JudgeReview => write!(f, "judge_review"),
            Self::Rebuttal => write!(f, "rebuttal"),
        }
    }
}

// ============================================================================
// Complexity and limits
// ============================================================================

/// Worker capability requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheap, fast implementer.
    Fast,
    /// Slower, expensive model. Always used for review.
    Strong,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Strong => write!(f, "strong"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    #[default]
    Standard,
    Complex,
}

impl Complexity {
    /// Tier requested from the implementer.
    pub fn implementer_tier(self) -> ModelTier {
        match self {
            Self::Trivial | Self::Standard => ModelTier::Fast,
            Self::Complex => ModelTier::Strong,
        }
    }
}

/// Per-phase timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    pub implementation: u64,
    pub local_review: u64,
    pub judge_review: u64,
    pub rebuttal: u64,
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Implementation => self.implementation,
            Phase::LocalReview => self.local_review,
            Phase::JudgeReview => self.judge_review,
            Phase::Rebuttal => self.rebuttal,
        };
        Duration::from_secs(secs)
    }
}

/// Budget a task may consume before the breakers trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_rebuttals: u32,
    pub max_review_cycles: u32,
    pub timeouts: PhaseTimeouts,
    pub max_tokens: u64,
    pub cost_ceiling_usd: f64,
}

impl Limits {
    pub fn for_complexity(complexity: Complexity) -> Self {
        match complexity {
            Complexity::Trivial => Self {
                max_rebuttals: 1,
                max_review_cycles: 2,
                timeouts: PhaseTimeouts {
                    implementation: 300,
                    local_review: 300,
                    judge_review: 600,
                    rebuttal: 300,
                },
                max_tokens: 50_000,
                cost_ceiling_usd: 1.0,
            },
            Complexity::Standard => Self {
                max_rebuttals: 2,
                max_review_cycles: 3,
                timeouts: PhaseTimeouts {
                    implementation: 900,
                    local_review: 600,
                    judge_review: 900,
                    rebuttal: 600,
                },
                max_tokens: 200_000,
                cost_ceiling_usd: 5.0,
            },
            Complexity::Complex => Self {
                max_rebuttals: 3,
                max_review_cycles: 5,
                timeouts: PhaseTimeouts {
                    implementation: 1800,
                    local_review: 1200,
                    judge_review: 1800,
                    rebuttal: 900,
                },
                max_tokens: 500_000,
                cost_ceiling_usd: 20.0,
            },
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::for_complexity(Complexity::Standard)
    }
}

/// Scope a worker's changes must stay within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Constraints {
    /// Gitignore-style globs. Empty means anywhere in the workspace.
    pub allowed_paths: Vec<String>,
    /// Gitignore-style globs no change may touch.
    pub forbidden_paths: Vec<String>,
    pub max_changed_files: usize,
    /// Per-draft limit on added + deleted lines.
    pub max_diff_lines: usize,
    /// Whether a draft may empty a file.
    pub allow_deletions: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            forbidden_paths: Vec::new(),
            max_changed_files: 10,
            max_diff_lines: 400,
            allow_deletions: false,
        }
    }
}

// ============================================================================
// Specification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceArtifact {
    /// Workspace-relative path.
    pub path: String,
    /// BLAKE3 hex of the content when the task was created.
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Specification {
    pub source_artifacts: Vec<SourceArtifact>,
    pub target_path: String,
    pub requirements: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

/// Externally supplied request to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskProposal {
    pub task_id: String,
    #[serde(default)]
    pub complexity: Complexity,
    /// Workspace-relative paths; hashed by the store on create.
    #[serde(default)]
    pub source_paths: Vec<String>,
    pub target_path: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Overrides the complexity defaults when present.
    #[serde(default)]
    pub limits: Option<Limits>,
    #[serde(default)]
    pub constraints: Option<Constraints>,
}

// ============================================================================
// Review artifacts
// ============================================================================

/// Reviewer-declared weight of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Blocking,
    Major,
    Minor,
    Style,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Finding {
    pub fn new(severity: FindingSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LocalVerdict {
    Pass,
    MinorIssues,
    CriticalFlaw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    Local,
    Judge,
}

/// Findings reported in one review pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFindings {
    pub cycle: u32,
    pub source: ReviewSource,
    pub findings: Vec<Finding>,
}

/// Data passed between phases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffData {
    pub changed_files: Vec<String>,
    pub diff_summary: Option<DiffSummary>,
    pub local_verdict: Option<LocalVerdict>,
    pub judge_verdict: Option<JudgeVerdict>,
    pub review_findings: Vec<CycleFindings>,
    pub rebuttal_text: Option<String>,
    /// Combined hash of the drafts currently under review.
    pub artifact_hash: Option<String>,
    /// Hashes of artifacts a reviewer or the gate already turned down.
    pub rejected_hashes: Vec<String>,
    /// Submission paths retained for human review.
    pub escalated_drafts: Vec<String>,
    pub stall_reason: Option<String>,
}

impl HandoffData {
    /// Every finding recorded so far, across all cycles.
    pub fn all_findings(&self) -> impl Iterator<Item = &Finding> {
        self.review_findings.iter().flat_map(|c| c.findings.iter())
    }

    pub fn record_rejected_hash(&mut self, hash: &str) {
        if !self.rejected_hashes.iter().any(|h| h == hash) {
            self.rejected_hashes.push(hash.to_string());
        }
    }
}

// ============================================================================
// Lock and breaker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLock {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    #[default]
    Armed,
    Tripped,
}

/// Breaker status and the counters the predicates read.
///
/// Counters only grow within an attempt. The one zeroing path is
/// `reset_for_new_attempt`, reachable only through `human_reset`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerState {
    state: BreakerStatus,
    trip_reason: Option<String>,
    trigger: Option<BreakerTrigger>,
    rebuttal_count: u32,
    review_cycle_count: u32,
    tokens_used: u64,
    cost_usd: f64,
}

impl BreakerState {
    pub fn state(&self) -> BreakerStatus {
        self.state
    }

    pub fn is_tripped(&self) -> bool {
        self.state == BreakerStatus::Tripped
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.trip_reason.as_deref()
    }

    pub fn trigger(&self) -> Option<BreakerTrigger> {
        self.trigger
    }

    pub fn rebuttal_count(&self) -> u32 {
        self.rebuttal_count
    }

    pub fn review_cycle_count(&self) -> u32 {
        self.review_cycle_count
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn record_rebuttal(&mut self) {
        self.rebuttal_count = self.rebuttal_count.saturating_add(1);
    }

    pub fn record_review_cycle(&mut self) {
        self.review_cycle_count = self.review_cycle_count.saturating_add(1);
    }

    /// Add worker usage. Negative or non-finite costs are ignored.
    pub fn record_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.cost_usd += cost_usd;
        }
    }

    /// Latch the breaker. The first trigger wins.
    pub fn trip(&mut self, trigger: BreakerTrigger, reason: impl Into<String>) {
        if self.is_tripped() {
            return;
        }
        self.state = BreakerStatus::Tripped;
        self.trigger = Some(trigger);
        self.trip_reason = Some(reason.into());
    }

    pub(crate) fn reset_for_new_attempt(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Contract
// ============================================================================

/// One entry of a contract's embedded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSummary {
    pub at: DateTime<Utc>,
    pub event: TaskEvent,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
}

/// The persisted record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContract {
    pub task_id: String,
    pub status: TaskStatus,
    pub status_reason: String,
    pub attempt: u32,
    pub complexity: Complexity,
    pub limits: Limits,
    pub constraints: Constraints,
    pub specification: Specification,
    #[serde(default)]
    pub handoff_data: HandoffData,
    #[serde(default)]
    pub lock: Option<TaskLock>,
    #[serde(default)]
    pub breaker: BreakerState,
    pub phase_started_at: DateTime<Utc>,
    pub version: u64,
    #[serde(default)]
    pub history: Vec<TransitionSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskContract {
    /// Fresh contract in `pending_implementer`, version 0 until first saved.
    pub fn new(
        task_id: impl Into<String>,
        complexity: Complexity,
        specification: Specification,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::PendingImplementer,
            status_reason: "created".to_string(),
            attempt: 1,
            complexity,
            limits: Limits::for_complexity(complexity),
            constraints: Constraints::default(),
            specification,
            handoff_data: HandoffData::default(),
            lock: None,
            breaker: BreakerState::default(),
            phase_started_at: now,
            version: 0,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// File and branch safe form of the task id.
    pub fn sanitized_id(&self) -> String {
        sanitize_task_id(&self.task_id)
    }

    pub fn phase(&self) -> Option<Phase> {
        self.status.phase()
    }

    /// Wall-clock time spent in the current phase, for use after a restart.
    pub fn phase_elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.phase_started_at).to_std().unwrap_or_default()
    }

    /// Whether `actor` holds an unexpired lock.
    pub fn is_locked_by(&self, actor: &str, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .map(|l| l.holder == actor && !l.is_expired_at(now))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_names() {
        for status in TaskStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            let back: TaskStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = TaskStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![&TaskStatus::Merged, &TaskStatus::ErikConsultation]
        );
    }

    #[test]
    fn test_status_phase_mapping() {
        assert_eq!(
            TaskStatus::TimeoutRebuttal.phase(),
            Some(Phase::Rebuttal)
        );
        assert_eq!(
            TaskStatus::JudgeReviewInProgress.phase(),
            Some(Phase::JudgeReview)
        );
        assert_eq!(TaskStatus::ReviewComplete.phase(), None);
    }

    #[test]
    fn test_complexity_tiers_and_limits() {
        assert_eq!(Complexity::Trivial.implementer_tier(), ModelTier::Fast);
        assert_eq!(Complexity::Standard.implementer_tier(), ModelTier::Fast);
        assert_eq!(Complexity::Complex.implementer_tier(), ModelTier::Strong);

        let complex = Limits::for_complexity(Complexity::Complex);
        let trivial = Limits::for_complexity(Complexity::Trivial);
        assert!(complex.max_review_cycles > trivial.max_review_cycles);
        assert_eq!(
            complex.timeouts.for_phase(Phase::Implementation),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn test_breaker_counters_are_additive() {
        let mut breaker = BreakerState::default();
        breaker.record_rebuttal();
        breaker.record_review_cycle();
        breaker.record_review_cycle();
        breaker.record_usage(100, 0.25);
        breaker.record_usage(50, -3.0);
        breaker.record_usage(0, f64::NAN);

        assert_eq!(breaker.rebuttal_count(), 1);
        assert_eq!(breaker.review_cycle_count(), 2);
        assert_eq!(breaker.tokens_used(), 150);
        assert_eq!(breaker.cost_usd(), 0.25);
    }

    #[test]
    fn test_breaker_first_trip_wins() {
        let mut breaker = BreakerState::default();
        breaker.trip(BreakerTrigger::RebuttalLimit, "too many rebuttals");
        breaker.trip(BreakerTrigger::CostCeiling, "over budget");
        assert!(breaker.is_tripped());
        assert_eq!(breaker.trigger(), Some(BreakerTrigger::RebuttalLimit));
        assert_eq!(breaker.trip_reason(), Some("too many rebuttals"));

        breaker.reset_for_new_attempt();
        assert_eq!(breaker, BreakerState::default());
    }

    #[test]
    fn test_proposal_rejects_unknown_fields() {
        let ok = r#"{"task_id":"t1","target_path":"src/lib.rs"}"#;
        let proposal: TaskProposal = serde_json::from_str(ok).unwrap();
        assert_eq!(proposal.complexity, Complexity::Standard);

        let bad = r#"{"task_id":"t1","target_path":"src/lib.rs","priority":9}"#;
        assert!(serde_json::from_str::<TaskProposal>(bad).is_err());
    }

    #[test]
    fn test_lock_expiry_and_ownership() {
        let now = Utc::now();
        let mut contract = TaskContract::new("t", Complexity::Trivial, Specification::default(), now);
        contract.lock = Some(TaskLock {
            holder: "runner-a".into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        });
        assert!(contract.is_locked_by("runner-a", now));
        assert!(!contract.is_locked_by("runner-b", now));
        assert!(!contract.is_locked_by("runner-a", now + chrono::Duration::seconds(30)));
    }
}
