//! Halt reports.
//!
//! Every task that stops in `erik_consultation` leaves a structured report
//! naming why it stopped and what a human can do about it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::breaker::BreakerTrigger;
use crate::contract::types::{BreakerStatus, Limits, TaskContract};
use crate::draft::DiffSummary;
use crate::error::GateResult;
use crate::fsutil::atomic_write;

/// What stopped the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltTrigger {
    Breaker { trigger: BreakerTrigger },
    /// The draft gate escalated a submission.
    DraftEscalated { original_path: String },
    /// The implementer gave up or broke the worker protocol.
    WorkerStalled,
    /// Git refused the merge into the main branch.
    MergeFailed,
}

impl std::fmt::Display for HaltTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breaker { trigger } => write!(f, "breaker:{trigger}"),
            Self::DraftEscalated { original_path } => write!(f, "draft_escalated:{original_path}"),
            Self::WorkerStalled => write!(f, "worker_stalled"),
            Self::MergeFailed => write!(f, "merge_failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOption {
    pub action: String,
    pub description: String,
    /// CLI invocation that carries the option out, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ResolutionOption {
    fn new(action: &str, description: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            description: description.into(),
            command: None,
        }
    }

    fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Breaker counters at the moment of the halt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerStatus,
    pub trip_reason: Option<String>,
    pub rebuttal_count: u32,
    pub review_cycle_count: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReport {
    pub task_id: String,
    pub attempt: u32,
    pub halted_at: DateTime<Utc>,
    pub trigger: HaltTrigger,
    pub reason: String,
    pub diff_summary: Option<DiffSummary>,
    pub changed_files: Vec<String>,
    /// Submission records kept in the sandbox for review.
    pub escalated_drafts: Vec<String>,
    pub breaker: BreakerSnapshot,
    pub resolution_options: Vec<ResolutionOption>,
}

impl HaltReport {
    pub fn build(
        contract: &TaskContract,
        trigger: HaltTrigger,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let resolution_options = resolution_options(&contract.task_id, &trigger);
        let b = &contract.breaker;
        Self {
            task_id: contract.task_id.clone(),
            attempt: contract.attempt,
            halted_at: now,
            reason: reason.into(),
            trigger,
            diff_summary: contract.handoff_data.diff_summary,
            changed_files: contract.handoff_data.changed_files.clone(),
            escalated_drafts: contract.handoff_data.escalated_drafts.clone(),
            breaker: BreakerSnapshot {
                state: b.state(),
                trip_reason: b.trip_reason().map(str::to_string),
                rebuttal_count: b.rebuttal_count(),
                review_cycle_count: b.review_cycle_count(),
                tokens_used: b.tokens_used(),
                cost_usd: b.cost_usd(),
                limits: contract.limits.clone(),
            },
            resolution_options,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}.attempt-{}.json",
            crate::fsutil::sanitize_task_id(&self.task_id),
            self.attempt
        )
    }

    /// Write the report into `halts_dir`, replacing any earlier report for
    /// the same attempt.
    pub fn write(&self, halts_dir: &Path) -> GateResult<PathBuf> {
        let path = halts_dir.join(self.file_name());
        atomic_write(&path, &serde_json::to_vec_pretty(self)?)?;
        info!(
            task_id = %self.task_id,
            attempt = self.attempt,
            trigger = %self.trigger,
            path = %path.display(),
            "Halt report written"
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> GateResult<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn resolution_options(task_id: &str, trigger: &HaltTrigger) -> Vec<ResolutionOption> {
    let reset = ResolutionOption::new(
        "reset",
        "Start a new attempt with the breaker re-armed and counters zeroed",
    )
    .with_command(format!("tollgate reset {task_id} --reason \"<what changed>\""));
    let abandon = ResolutionOption::new(
        "abandon",
        "Leave the task archived; the attempt record stays as the post-mortem",
    );

    let specific = match trigger {
        HaltTrigger::Breaker { trigger } => match trigger {
            BreakerTrigger::RebuttalLimit | BreakerTrigger::VerdictParadox => {
                ResolutionOption::new(
                    "adjudicate",
                    "Read the conflicting review findings and decide which reviewer is right before resetting",
                )
            }
            BreakerTrigger::DeletionRatio => ResolutionOption::new(
                "inspect_deletions",
                "Inspect the diff; if the removal is intended, apply it by hand or raise max_delete_ratio",
            ),
            BreakerTrigger::ArtifactLoop => ResolutionOption::new(
                "clarify_requirements",
                "The implementer resubmitted a rejected artifact; sharpen the requirements or acceptance criteria",
            ),
            BreakerTrigger::NonSubstantiveReview => ResolutionOption::new(
                "accept_as_is",
                "Reviews only raised minor or style findings; merge the change by hand if it is acceptable",
            ),
            BreakerTrigger::PhaseTimeout => ResolutionOption::new(
                "raise_timeout",
                "Check worker health, then raise the phase timeout or the task complexity",
            ),
            BreakerTrigger::CostCeiling => ResolutionOption::new(
                "raise_budget",
                "Raise cost_ceiling_usd or max_tokens, or split the task into smaller ones",
            ),
            BreakerTrigger::ScopeViolation => ResolutionOption::new(
                "widen_scope",
                "Review the out-of-scope files; widen allowed_paths or split the task",
            ),
            BreakerTrigger::ReviewCycleLimit => ResolutionOption::new(
                "split_task",
                "The change did not converge within the review budget; split it or raise max_review_cycles",
            ),
        },
        HaltTrigger::DraftEscalated { original_path } => ResolutionOption::new(
            "review_draft",
            format!(
                "Review the retained draft for {original_path} in the sandbox and apply or discard it by hand"
            ),
        ),
        HaltTrigger::WorkerStalled => ResolutionOption::new(
            "reassign",
            "Reset with a higher complexity so a stronger model takes the task",
        ),
        HaltTrigger::MergeFailed => ResolutionOption::new(
            "resolve_merge",
            format!("Merge branch tollgate/{} into main by hand and resolve the conflicts", crate::fsutil::sanitize_task_id(task_id)),
        ),
    };

    vec![specific, reset, abandon]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::types::{Complexity, Specification};

    #[test]
    fn test_every_trigger_offers_two_or_more_options() {
        let mut triggers: Vec<HaltTrigger> = BreakerTrigger::ALL
            .iter()
            .map(|t| HaltTrigger::Breaker { trigger: *t })
            .collect();
        triggers.push(HaltTrigger::WorkerStalled);
        triggers.push(HaltTrigger::MergeFailed);
        triggers.push(HaltTrigger::DraftEscalated {
            original_path: "src/lib.rs".into(),
        });
        for trigger in triggers {
            let options = resolution_options("t1", &trigger);
            assert!(options.len() >= 2, "{trigger}");
            assert!(options.iter().any(|o| o.command.is_some()));
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut contract =
            TaskContract::new("t 1", Complexity::Trivial, Specification::default(), Utc::now());
        contract.breaker.record_rebuttal();
        contract
            .breaker
            .trip(BreakerTrigger::RebuttalLimit, "2 rebuttals exceed 1");

        let report = HaltReport::build(
            &contract,
            HaltTrigger::Breaker {
                trigger: BreakerTrigger::RebuttalLimit,
            },
            "2 rebuttals exceed 1",
            Utc::now(),
        );
        let path = report.write(dir.path()).unwrap();
        assert!(path.ends_with("t_1.attempt-1.json"));

        let loaded = HaltReport::load(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.breaker.rebuttal_count, 1);
        assert_eq!(loaded.breaker.state, BreakerStatus::Tripped);
    }
}
