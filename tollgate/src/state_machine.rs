//! Task state machine: an explicit transition table.
//!
//! `transition()` is a pure lookup over `(status, event)`. It is the only place
//! a new status is computed, and unmapped pairs are errors, never defaults.
//! `apply_event()` writes the result into a contract and returns the log entry
//! the caller appends to the audit log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::TransitionLogEntry;
use crate::contract::types::{TaskContract, TaskStatus, TransitionSummary};
use crate::error::{GateError, GateResult};

/// Everything that can happen to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    ImplementerStarted,
    ImplementationSubmitted,
    /// Every draft of a submission was refused by the gate.
    DraftRejected,
    ImplementationTimedOut,
    LocalReviewStarted,
    LocalReviewCompleted,
    LocalReviewTimedOut,
    JudgeReviewStarted,
    JudgeApproved,
    JudgeRejected,
    JudgeReviewTimedOut,
    RebuttalStarted,
    RebuttalSubmitted,
    RebuttalConceded,
    RebuttalTimedOut,
    TimeoutRetry,
    MergeCompleted,
    BreakerTripped,
    /// Draft escalation or worker stall.
    Escalated,
    HumanReset,
}

impl TaskEvent {
    pub const ALL: [TaskEvent; 20] = [
        Self::ImplementerStarted,
        Self::ImplementationSubmitted,
        Self::DraftRejected,
        Self::ImplementationTimedOut,
        Self::LocalReviewStarted,
        Self::LocalReviewCompleted,
        Self::LocalReviewTimedOut,
        Self::JudgeReviewStarted,
        Self::JudgeApproved,
        Self::JudgeRejected,
        Self::JudgeReviewTimedOut,
        Self::RebuttalStarted,
        Self::RebuttalSubmitted,
        Self::RebuttalConceded,
        Self::RebuttalTimedOut,
        Self::TimeoutRetry,
        Self::MergeCompleted,
        Self::BreakerTripped,
        Self::Escalated,
        Self::HumanReset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImplementerStarted => "implementer_started",
            Self::ImplementationSubmitted => "implementation_submitted",
            Self::DraftRejected => "draft_rejected",
            Self::ImplementationTimedOut => "implementation_timed_out",
            Self::LocalReviewStarted => "local_review_started",
            Self::LocalReviewCompleted => "local_review_completed",
            Self::LocalReviewTimedOut => "local_review_timed_out",
            Self::JudgeReviewStarted => "judge_review_started",
            Self::JudgeApproved => "judge_approved",
            Self::JudgeRejected => "judge_rejected",
            Self::JudgeReviewTimedOut => "judge_review_timed_out",
            Self::RebuttalStarted => "rebuttal_started",
            Self::RebuttalSubmitted => "rebuttal_submitted",
            Self::RebuttalConceded => "rebuttal_conceded",
            Self::RebuttalTimedOut => "rebuttal_timed_out",
            Self::TimeoutRetry => "timeout_retry",
            Self::MergeCompleted => "merge_completed",
            Self::BreakerTripped => "breaker_tripped",
            Self::Escalated => "escalated",
            Self::HumanReset => "human_reset",
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edges that leave one specific status.
///
/// ```text
/// pending_implementer        --implementer_started-->      implementation_in_progress
/// implementation_in_progress --implementation_submitted--> pending_local_review
///                            --draft_rejected-->           pending_implementer
/// local_review_in_progress   --local_review_completed-->   pending_judge_review
/// judge_review_in_progress   --judge_approved-->           review_complete
///                            --judge_rejected-->           pending_rebuttal
/// rebuttal_in_progress       --rebuttal_submitted-->       pending_judge_review
///                            --rebuttal_conceded-->        pending_implementer
/// timeout_<phase>            --timeout_retry-->            pending_<phase>
/// review_complete            --merge_completed-->          merged
/// ```
#[rustfmt::skip]
const TRANSITIONS: &[(TaskStatus, TaskEvent, TaskStatus, &str)] = {
    use TaskEvent as E;
    use TaskStatus as S;
    &[
        (S::PendingImplementer, E::ImplementerStarted, S::ImplementationInProgress, "implementer started"),
        (S::ImplementationInProgress, E::ImplementationSubmitted, S::PendingLocalReview, "implementation submitted for review"),
        (S::ImplementationInProgress, E::DraftRejected, S::PendingImplementer, "drafts rejected by the gate"),
        (S::ImplementationInProgress, E::ImplementationTimedOut, S::TimeoutImplementation, "implementation timed out"),
        (S::PendingLocalReview, E::LocalReviewStarted, S::LocalReviewInProgress, "local review started"),
        (S::LocalReviewInProgress, E::LocalReviewCompleted, S::PendingJudgeReview, "local review completed"),
        (S::LocalReviewInProgress, E::LocalReviewTimedOut, S::TimeoutLocalReview, "local review timed out"),
        (S::PendingJudgeReview, E::JudgeReviewStarted, S::JudgeReviewInProgress, "judge review started"),
        (S::JudgeReviewInProgress, E::JudgeApproved, S::ReviewComplete, "judge approved"),
        (S::JudgeReviewInProgress, E::JudgeRejected, S::PendingRebuttal, "judge rejected"),
        (S::JudgeReviewInProgress, E::JudgeReviewTimedOut, S::TimeoutJudgeReview, "judge review timed out"),
        (S::PendingRebuttal, E::RebuttalStarted, S::RebuttalInProgress, "rebuttal started"),
        (S::RebuttalInProgress, E::RebuttalSubmitted, S::PendingJudgeReview, "rebuttal submitted to judge"),
        (S::RebuttalInProgress, E::RebuttalConceded, S::PendingImplementer, "implementer conceded; reworking"),
        (S::RebuttalInProgress, E::RebuttalTimedOut, S::TimeoutRebuttal, "rebuttal timed out"),
        (S::TimeoutImplementation, E::TimeoutRetry, S::PendingImplementer, "retrying implementation"),
        (S::TimeoutLocalReview, E::TimeoutRetry, S::PendingLocalReview, "retrying local review"),
        (S::TimeoutJudgeReview, E::TimeoutRetry, S::PendingJudgeReview, "retrying judge review"),
        (S::TimeoutRebuttal, E::TimeoutRetry, S::PendingRebuttal, "retrying rebuttal"),
        (S::ReviewComplete, E::MergeCompleted, S::Merged, "merged to main"),
        (S::ErikConsultation, E::HumanReset, S::PendingImplementer, "reset by operator"),
    ]
};

/// Look up the next status for `(from, event)`.
pub fn transition(from: TaskStatus, event: TaskEvent) -> GateResult<(TaskStatus, &'static str)> {
    match event {
        TaskEvent::BreakerTripped if !from.is_terminal() => {
            return Ok((TaskStatus::ErikConsultation, "circuit breaker tripped"));
        }
        TaskEvent::Escalated if !from.is_terminal() => {
            return Ok((TaskStatus::ErikConsultation, "escalated for human review"));
        }
        _ => {}
    }

    TRANSITIONS
        .iter()
        .find(|(f, e, _, _)| *f == from && *e == event)
        .map(|(_, _, to, reason)| (*to, *reason))
        .ok_or(GateError::InvalidTransition { from, event })
}

/// Whether `(from, event)` has an edge.
pub fn is_legal(from: TaskStatus, event: TaskEvent) -> bool {
    transition(from, event).is_ok()
}

/// Apply `event` to `contract` with the table's reason.
pub fn apply_event(
    contract: &mut TaskContract,
    event: TaskEvent,
    now: DateTime<Utc>,
) -> GateResult<TransitionLogEntry> {
    apply_event_with_reason(contract, event, None, now)
}

/// Apply `event` to `contract`, appending `detail` to the recorded reason.
///
/// Besides the status this updates `status_reason`, the phase clock, the
/// embedded history and the review counters. `human_reset` also bumps the
/// attempt and re-arms the breaker.
pub fn apply_event_with_reason(
    contract: &mut TaskContract,
    event: TaskEvent,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> GateResult<TransitionLogEntry> {
    let from = contract.status;
    let (to, base_reason) = transition(from, event)?;
    let reason = match detail {
        Some(d) if !d.is_empty() => format!("{base_reason}: {d}"),
        _ => base_reason.to_string(),
    };

    match event {
        TaskEvent::JudgeApproved | TaskEvent::JudgeRejected => {
            contract.breaker.record_review_cycle()
        }
        TaskEvent::RebuttalSubmitted => contract.breaker.record_rebuttal(),
        TaskEvent::HumanReset => {
            contract.attempt += 1;
            contract.breaker.reset_for_new_attempt();
            let rejected = std::mem::take(&mut contract.handoff_data.rejected_hashes);
            contract.handoff_data = Default::default();
            contract.handoff_data.rejected_hashes = rejected;
        }
        _ => {}
    }

    // Queue time before a worker picks the phase up is not phase time.
    let restarts_clock = matches!(
        event,
        TaskEvent::ImplementerStarted
            | TaskEvent::LocalReviewStarted
            | TaskEvent::JudgeReviewStarted
            | TaskEvent::RebuttalStarted
            | TaskEvent::TimeoutRetry
            | TaskEvent::HumanReset
    );
    if from.phase() != to.phase() || restarts_clock {
        contract.phase_started_at = now;
    }

    contract.status = to;
    contract.status_reason = reason.clone();
    contract.updated_at = now;
    contract.history.push(TransitionSummary {
        at: now,
        event,
        from,
        to,
        reason,
    });

    tracing::debug!(
        task_id = %contract.task_id,
        from = %from,
        to = %to,
        event = %event,
        "State transition"
    );

    Ok(TransitionLogEntry {
        timestamp: now,
        task_id: contract.task_id.clone(),
        event,
        old_status: from,
        new_status: to,
        attempt: contract.attempt,
    })
}
