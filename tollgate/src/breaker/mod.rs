//! Circuit breakers: nine safety predicates evaluated after every phase.
//!
//! Evaluation order is fixed and the first true predicate is the reported
//! trigger. A trip forces the task into `erik_consultation` whatever
//! transition was requested, and only `human_reset` re-arms it.

pub mod classifier;
pub mod scope;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::TransitionLogEntry;
use crate::config::GateConfig;
use crate::contract::types::{JudgeVerdict, LocalVerdict, TaskContract, TaskStatus};
use crate::draft::DiffSummary;
use crate::error::{GateError, GateResult};
use crate::state_machine::{apply_event_with_reason, transition, TaskEvent};

pub use classifier::{FindingClassifier, SeverityClassifier};
pub use scope::PathScope;

/// Review cycles after which a review consisting only of noise halts.
pub const NON_SUBSTANTIVE_CYCLE_THRESHOLD: u32 = 3;

/// The nine predicates, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTrigger {
    RebuttalLimit,
    DeletionRatio,
    VerdictParadox,
    ArtifactLoop,
    NonSubstantiveReview,
    PhaseTimeout,
    CostCeiling,
    ScopeViolation,
    ReviewCycleLimit,
}

impl BreakerTrigger {
    pub const ALL: [BreakerTrigger; 9] = [
        Self::RebuttalLimit,
        Self::DeletionRatio,
        Self::VerdictParadox,
        Self::ArtifactLoop,
        Self::NonSubstantiveReview,
        Self::PhaseTimeout,
        Self::CostCeiling,
        Self::ScopeViolation,
        Self::ReviewCycleLimit,
    ];

    /// 1-based position in the evaluation order.
    pub fn ordinal(self) -> usize {
        Self::ALL.iter().position(|t| *t == self).map_or(0, |i| i + 1)
    }
}

impl fmt::Display for BreakerTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RebuttalLimit => "rebuttal_limit",
            Self::DeletionRatio => "deletion_ratio",
            Self::VerdictParadox => "verdict_paradox",
            Self::ArtifactLoop => "artifact_loop",
            Self::NonSubstantiveReview => "non_substantive_review",
            Self::PhaseTimeout => "phase_timeout",
            Self::CostCeiling => "cost_ceiling",
            Self::ScopeViolation => "scope_violation",
            Self::ReviewCycleLimit => "review_cycle_limit",
        };
        f.write_str(s)
    }
}

/// Inputs that live outside the contract.
#[derive(Debug, Clone, Default)]
pub struct BreakerInput {
    /// Diff of the drafts produced in this phase.
    pub diff_summary: Option<DiffSummary>,
    /// Combined artifact hash produced in this phase, if any.
    pub fresh_artifact_hash: Option<String>,
    /// Time spent in the current phase.
    pub phase_elapsed: Duration,
}

impl BreakerInput {
    pub fn elapsed(phase_elapsed: Duration) -> Self {
        Self {
            phase_elapsed,
            ..Self::default()
        }
    }
}

/// A tripped predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTrip {
    pub trigger: BreakerTrigger,
    pub reason: String,
}

impl BreakerTrip {
    fn new(trigger: BreakerTrigger, reason: impl Into<String>) -> Self {
        Self {
            trigger,
            reason: reason.into(),
        }
    }

    pub fn into_error(self, task_id: &str) -> GateError {
        GateError::CircuitBreakerTripped {
            task_id: task_id.to_string(),
            trigger: self.trigger,
            reason: self.reason,
        }
    }
}

/// Outcome of [`CircuitBreakerEvaluator::advance`].
#[derive(Debug, Clone)]
pub struct Advance {
    /// Transitions applied, in order. Append all of them to the audit log.
    pub entries: Vec<TransitionLogEntry>,
    pub tripped: Option<BreakerTrip>,
}

/// Stateless predicate set.
pub struct CircuitBreakerEvaluator {
    max_delete_ratio: f64,
    classifier: Box<dyn FindingClassifier>,
}

impl CircuitBreakerEvaluator {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            max_delete_ratio: config.max_delete_ratio,
            classifier: Box::new(SeverityClassifier),
        }
    }

    pub fn with_classifier(mut self, classifier: impl FindingClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// First tripped predicate, if any.
    pub fn evaluate(&self, contract: &TaskContract, input: &BreakerInput) -> Option<BreakerTrip> {
        self.evaluate_all(contract, input).into_iter().next()
    }

    /// Every tripped predicate, in evaluation order.
    pub fn evaluate_all(&self, contract: &TaskContract, input: &BreakerInput) -> Vec<BreakerTrip> {
        let mut trips = Vec::new();
        let breaker = &contract.breaker;
        let limits = &contract.limits;
        let handoff = &contract.handoff_data;

        // 1
        if breaker.rebuttal_count() > limits.max_rebuttals {
            trips.push(BreakerTrip::new(
                BreakerTrigger::RebuttalLimit,
                format!(
                    "{} rebuttals exceed the limit of {}",
                    breaker.rebuttal_count(),
                    limits.max_rebuttals
                ),
            ));
        }

        // 2
        if let Some(diff) = input.diff_summary.as_ref().or(handoff.diff_summary.as_ref()) {
            if diff.deletion_ratio > self.max_delete_ratio {
                trips.push(BreakerTrip::new(
                    BreakerTrigger::DeletionRatio,
                    format!(
                        "deletion ratio {:.2} exceeds {:.2} ({} of {} lines deleted)",
                        diff.deletion_ratio,
                        self.max_delete_ratio,
                        diff.lines_deleted,
                        diff.original_lines
                    ),
                ));
            }
        }

        // 3
        if handoff.judge_verdict == Some(JudgeVerdict::Pass)
            && handoff.local_verdict == Some(LocalVerdict::CriticalFlaw)
        {
            trips.push(BreakerTrip::new(
                BreakerTrigger::VerdictParadox,
                "judge passed work the local reviewer marked critical_flaw",
            ));
        }

        // 4
        if let Some(hash) = &input.fresh_artifact_hash {
            if handoff.rejected_hashes.iter().any(|h| h == hash) {
                trips.push(BreakerTrip::new(
                    BreakerTrigger::ArtifactLoop,
                    format!("artifact {} was already rejected for this task", short(hash)),
                ));
            }
        }

        // 5
        if breaker.review_cycle_count() >= NON_SUBSTANTIVE_CYCLE_THRESHOLD {
            let mut findings = handoff.all_findings().peekable();
            let any = findings.peek().is_some();
            if any && findings.all(|f| !self.classifier.is_substantive(f)) {
                trips.push(BreakerTrip::new(
                    BreakerTrigger::NonSubstantiveReview,
                    format!(
                        "{} review cycles produced only non-substantive findings",
                        breaker.review_cycle_count()
                    ),
                ));
            }
        }

        // 6
        if let Some(phase) = contract.phase() {
            let budget = limits.timeouts.for_phase(phase);
            if input.phase_elapsed > budget {
                trips.push(BreakerTrip::new(
                    BreakerTrigger::PhaseTimeout,
                    format!(
                        "{phase} phase ran {}s, limit {}s",
                        input.phase_elapsed.as_secs(),
                        budget.as_secs()
                    ),
                ));
            }
        }

        // 7
        if breaker.cost_usd() > limits.cost_ceiling_usd {
            trips.push(BreakerTrip::new(
                BreakerTrigger::CostCeiling,
                format!(
                    "cost ${:.2} exceeds ceiling ${:.2}",
                    breaker.cost_usd(),
                    limits.cost_ceiling_usd
                ),
            ));
        } else if breaker.tokens_used() > limits.max_tokens {
            trips.push(BreakerTrip::new(
                BreakerTrigger::CostCeiling,
                format!(
                    "{} tokens exceed the budget of {}",
                    breaker.tokens_used(),
                    limits.max_tokens
                ),
            ));
        }

        // 8
        if let Some(reason) = scope_violation(contract) {
            trips.push(BreakerTrip::new(BreakerTrigger::ScopeViolation, reason));
        }

        // 9
        if breaker.review_cycle_count() > limits.max_review_cycles {
            trips.push(BreakerTrip::new(
                BreakerTrigger::ReviewCycleLimit,
                format!(
                    "{} review cycles exceed the limit of {}",
                    breaker.review_cycle_count(),
                    limits.max_review_cycles
                ),
            ));
        }

        trips
    }

    /// Apply `event`, evaluating the breakers against the resulting contract.
    ///
    /// - Escalations and explicit breaker events are applied as-is.
    /// - If a predicate trips and the requested status is terminal, the
    ///   requested transition is dropped and the task goes straight to
    ///   `erik_consultation`.
    /// - Otherwise the requested transition is kept and followed by
    ///   `breaker_tripped`.
    ///
    /// Rejected artifact hashes are recorded after evaluation so a rejection
    /// never matches itself.
    pub fn advance(
        &self,
        contract: &mut TaskContract,
        event: TaskEvent,
        detail: Option<&str>,
        input: &BreakerInput,
        now: DateTime<Utc>,
    ) -> GateResult<Advance> {
        let (requested, _) = transition(contract.status, event)?;

        if requested == TaskStatus::ErikConsultation || event == TaskEvent::HumanReset {
            let entry = apply_event_with_reason(contract, event, detail, now)?;
            return Ok(Advance {
                entries: vec![entry],
                tripped: None,
            });
        }

        let mut candidate = contract.clone();
        let first = apply_event_with_reason(&mut candidate, event, detail, now)?;

        let Some(trip) = self.evaluate(&candidate, input) else {
            *contract = candidate;
            record_rejection(contract, event, input);
            return Ok(Advance {
                entries: vec![first],
                tripped: None,
            });
        };

        warn!(
            task_id = %contract.task_id,
            trigger = %trip.trigger,
            reason = %trip.reason,
            requested = %requested,
            "Circuit breaker tripped"
        );

        let mut entries = Vec::with_capacity(2);
        if !requested.is_terminal() {
            *contract = candidate;
            entries.push(first);
        }
        record_rejection(contract, event, input);
        contract.breaker.trip(trip.trigger, trip.reason.clone());
        entries.push(apply_event_with_reason(
            contract,
            TaskEvent::BreakerTripped,
            Some(&format!("{}: {}", trip.trigger, trip.reason)),
            now,
        )?);

        info!(task_id = %contract.task_id, attempt = contract.attempt, "Task halted for consultation");
        Ok(Advance {
            entries,
            tripped: Some(trip),
        })
    }
}

fn record_rejection(contract: &mut TaskContract, event: TaskEvent, input: &BreakerInput) {
    let hash = match event {
        TaskEvent::DraftRejected => input.fresh_artifact_hash.clone(),
        TaskEvent::JudgeRejected => contract.handoff_data.artifact_hash.clone(),
        _ => None,
    };
    if let Some(hash) = hash {
        contract.handoff_data.record_rejected_hash(&hash);
    }
}

fn scope_violation(contract: &TaskContract) -> Option<String> {
    let constraints = &contract.constraints;
    let changed = &contract.handoff_data.changed_files;

    if changed.len() > constraints.max_changed_files {
        return Some(format!(
            "{} changed files exceed the limit of {}",
            changed.len(),
            constraints.max_changed_files
        ));
    }

    let scope = match PathScope::from_constraints(constraints) {
        Ok(scope) => scope,
        // Unparseable constraints cannot prove anything is in scope.
        Err(e) => return Some(format!("path constraints unusable: {e}")),
    };
    changed.iter().find_map(|f| scope.violation(f))
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::types::{
        Complexity, CycleFindings, Finding, FindingSeverity, ReviewSource, Specification,
    };

    fn contract() -> TaskContract {
        TaskContract::new("t1", Complexity::Standard, Specification::default(), Utc::now())
    }

    fn evaluator() -> CircuitBreakerEvaluator {
        CircuitBreakerEvaluator::new(&GateConfig::default())
    }

    fn diff(deleted: usize, original: usize) -> DiffSummary {
        DiffSummary::new(0, deleted, original)
    }

    #[test]
    fn test_clean_contract_does_not_trip() {
        assert!(evaluator().evaluate(&contract(), &BreakerInput::default()).is_none());
    }

    #[test]
    fn test_rebuttal_limit() {
        let mut c = contract();
        for _ in 0..c.limits.max_rebuttals {
            c.breaker.record_rebuttal();
        }
        assert!(evaluator().evaluate(&c, &BreakerInput::default()).is_none());
        c.breaker.record_rebuttal();
        let trip = evaluator().evaluate(&c, &BreakerInput::default()).unwrap();
        assert_eq!(trip.trigger, BreakerTrigger::RebuttalLimit);
    }

    #[test]
    fn test_deletion_ratio_strictly_above_threshold() {
        let c = contract();
        let at = BreakerInput {
            diff_summary: Some(diff(50, 100)),
            ..Default::default()
        };
        assert!(evaluator().evaluate(&c, &at).is_none());
        let above = BreakerInput {
            diff_summary: Some(diff(51, 100)),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&c, &above).unwrap().trigger,
            BreakerTrigger::DeletionRatio
        );
    }

    #[test]
    fn test_verdict_paradox() {
        let mut c = contract();
        c.handoff_data.local_verdict = Some(LocalVerdict::CriticalFlaw);
        c.handoff_data.judge_verdict = Some(JudgeVerdict::Pass);
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::VerdictParadox
        );
    }

    #[test]
    fn test_artifact_loop_uses_fresh_hash_only() {
        let mut c = contract();
        c.handoff_data.record_rejected_hash("aaaa");
        c.handoff_data.artifact_hash = Some("aaaa".into());
        assert!(evaluator().evaluate(&c, &BreakerInput::default()).is_none());

        let input = BreakerInput {
            fresh_artifact_hash: Some("aaaa".into()),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&c, &input).unwrap().trigger,
            BreakerTrigger::ArtifactLoop
        );
    }

    #[test]
    fn test_non_substantive_review() {
        let mut c = contract();
        c.limits.max_review_cycles = 10;
        for cycle in 1..=3 {
            c.breaker.record_review_cycle();
            c.handoff_data.review_findings.push(CycleFindings {
                cycle,
                source: ReviewSource::Judge,
                findings: vec![Finding::new(FindingSeverity::Style, "nit")],
            });
        }
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::NonSubstantiveReview
        );

        c.handoff_data.review_findings[0]
            .findings
            .push(Finding::new(FindingSeverity::Major, "unsound"));
        assert!(evaluator().evaluate(&c, &BreakerInput::default()).is_none());
    }

    #[test]
    fn test_no_findings_is_not_non_substantive() {
        let mut c = contract();
        c.limits.max_review_cycles = 10;
        for _ in 0..3 {
            c.breaker.record_review_cycle();
        }
        assert!(evaluator().evaluate(&c, &BreakerInput::default()).is_none());
    }

    #[test]
    fn test_phase_timeout() {
        let c = contract();
        let limit = c.limits.timeouts.implementation;
        assert!(evaluator()
            .evaluate(&c, &BreakerInput::elapsed(Duration::from_secs(limit)))
            .is_none());
        let trip = evaluator()
            .evaluate(&c, &BreakerInput::elapsed(Duration::from_secs(limit + 1)))
            .unwrap();
        assert_eq!(trip.trigger, BreakerTrigger::PhaseTimeout);
        assert!(trip.reason.contains("implementation"));
    }

    #[test]
    fn test_cost_and_token_budget() {
        let mut c = contract();
        c.breaker.record_usage(10, c.limits.cost_ceiling_usd + 0.01);
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::CostCeiling
        );

        let mut c = contract();
        c.breaker.record_usage(c.limits.max_tokens + 1, 0.0);
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::CostCeiling
        );
    }

    #[test]
    fn test_scope_violation() {
        let mut c = contract();
        c.constraints.forbidden_paths = vec!["secrets/".into()];
        c.handoff_data.changed_files = vec!["src/lib.rs".into()];
        assert!(evaluator().evaluate(&c, &BreakerInput::default()).is_none());

        c.handoff_data.changed_files.push("secrets/prod.toml".into());
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::ScopeViolation
        );

        let mut c = contract();
        c.constraints.max_changed_files = 1;
        c.handoff_data.changed_files = vec!["a.rs".into(), "b.rs".into()];
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::ScopeViolation
        );
    }

    #[test]
    fn test_review_cycle_limit() {
        let mut c = contract();
        // Substantive findings keep predicate 5 quiet.
        c.handoff_data.review_findings.push(CycleFindings {
            cycle: 1,
            source: ReviewSource::Judge,
            findings: vec![Finding::new(FindingSeverity::Blocking, "wrong")],
        });
        for _ in 0..=c.limits.max_review_cycles {
            c.breaker.record_review_cycle();
        }
        assert_eq!(
            evaluator().evaluate(&c, &BreakerInput::default()).unwrap().trigger,
            BreakerTrigger::ReviewCycleLimit
        );
    }

    #[test]
    fn test_first_predicate_wins() {
        let mut c = contract();
        for _ in 0..=c.limits.max_rebuttals {
            c.breaker.record_rebuttal();
        }
        c.breaker.record_usage(0, 1_000.0);
        let all = evaluator().evaluate_all(&c, &BreakerInput::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].trigger, BreakerTrigger::RebuttalLimit);
        assert_eq!(all[1].trigger, BreakerTrigger::CostCeiling);
    }

    #[test]
    fn test_advance_overrides_requested_transition() {
        let mut c = contract();
        c.status = TaskStatus::RebuttalInProgress;
        for _ in 0..c.limits.max_rebuttals {
            c.breaker.record_rebuttal();
        }

        // This submission pushes the count over the limit.
        let advance = evaluator()
            .advance(&mut c, TaskEvent::RebuttalSubmitted, None, &BreakerInput::default(), Utc::now())
            .unwrap();
        assert_eq!(c.status, TaskStatus::ErikConsultation);
        assert!(c.breaker.is_tripped());
        assert_eq!(c.breaker.trigger(), Some(BreakerTrigger::RebuttalLimit));
        assert_eq!(advance.entries.len(), 2);
        assert_eq!(advance.entries[0].new_status, TaskStatus::PendingJudgeReview);
        assert_eq!(advance.entries[1].event, TaskEvent::BreakerTripped);
    }

    #[test]
    fn test_advance_blocks_merge_when_tripped() {
        let mut c = contract();
        c.status = TaskStatus::ReviewComplete;
        c.breaker.record_usage(0, 1_000.0);
        let advance = evaluator()
            .advance(&mut c, TaskEvent::MergeCompleted, None, &BreakerInput::default(), Utc::now())
            .unwrap();
        assert_eq!(advance.entries.len(), 1);
        assert_eq!(advance.entries[0].old_status, TaskStatus::ReviewComplete);
        assert_eq!(c.status, TaskStatus::ErikConsultation);
    }

    #[test]
    fn test_advance_records_rejection_after_evaluation() {
        let mut c = contract();
        c.status = TaskStatus::JudgeReviewInProgress;
        c.handoff_data.artifact_hash = Some("h1".into());
        evaluator()
            .advance(&mut c, TaskEvent::JudgeRejected, None, &BreakerInput::default(), Utc::now())
            .unwrap();
        assert_eq!(c.status, TaskStatus::PendingRebuttal);
        assert_eq!(c.handoff_data.rejected_hashes, vec!["h1".to_string()]);
    }

    #[test]
    fn test_advance_rejects_unmapped_event() {
        let mut c = contract();
        let err = evaluator()
            .advance(&mut c, TaskEvent::JudgeApproved, None, &BreakerInput::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidTransition { .. }));
        assert_eq!(c.status, TaskStatus::PendingImplementer);
    }

    #[test]
    fn test_trigger_order() {
        assert_eq!(BreakerTrigger::RebuttalLimit.ordinal(), 1);
        assert_eq!(BreakerTrigger::ReviewCycleLimit.ordinal(), 9);
        assert_eq!(BreakerTrigger::ArtifactLoop.to_string(), "artifact_loop");
    }
}
