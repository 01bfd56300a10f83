//! Orchestrator loop: lock a task, run one phase, record the outcome.
//!
//! ```text
//! pending_implementer ─► implementer ─► DraftGate ─► pending_local_review
//!        ▲                                               │
//!        │ draft_rejected / rebuttal_conceded            ▼
//!        └──────────── rebuttal ◄── judge panel ◄── local reviewer
//!                                       │
//!                                       ▼ judge_approved
//!                           review_complete ─► apply + merge ─► merged
//! ```
//!
//! Every outcome, including a worker timeout, goes through
//! `CircuitBreakerEvaluator::advance`, is saved to the contract store,
//! appended to the audit log and checkpointed in git. A task that reaches
//! `erik_consultation` gets a halt report and is archived.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tollgate::breaker::{Advance, BreakerInput, BreakerTrigger, CircuitBreakerEvaluator};
use tollgate::contract::{
    ContractStore, CycleFindings, JudgeVerdict, ModelTier, ReviewSource, TaskContract,
    TaskProposal, TaskStatus,
};
use tollgate::draft::{
    artifact_hash, artifact_names, Decision, DiffSummary, DraftGate, DraftSubmission,
    GateDecision,
};
use tollgate::{AuditLog, GateError, HaltReport, HaltTrigger, TaskEvent, TransitionLogEntry};

use crate::config::RunnerConfig;
use crate::pool::run_bounded;
use crate::poll::{AdaptivePoll, WakeReason};
use crate::prompts;
use crate::vcs::VersionControl;
use crate::worker::{
    ImplementationReport, RebuttalStance, Worker, WorkerError, WorkerRequest, WorkerResponse,
    WorkerRole,
};

/// Lock lifetime for statuses without a phase budget.
const DEFAULT_LOCK_SECS: u64 = 300;

/// What one `step` did to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// At least one transition was recorded.
    Advanced,
    /// Another actor holds the lock.
    Skipped,
    /// A transient worker failure; the task resumes on a later pass.
    Deferred,
}

/// Start of the current phase in monotonic time.
#[derive(Debug, Clone, Copy)]
struct PhaseClock {
    started_at: chrono::DateTime<Utc>,
    instant: Instant,
}

/// Result of one bounded worker call.
enum CallOutcome {
    Response(WorkerResponse),
    TimedOut,
    Failed(WorkerError),
}

/// Time spent in a phase against its budget.
#[derive(Debug, Clone, Copy)]
struct Timing {
    elapsed: Duration,
    budget: Duration,
}

impl Timing {
    fn input(&self) -> BreakerInput {
        BreakerInput::elapsed(self.elapsed)
    }

    /// Timeout events carry at most the budget itself, so the timeout is
    /// recorded as a transition rather than a breaker trip.
    fn timeout_input(&self) -> BreakerInput {
        BreakerInput::elapsed(self.elapsed.min(self.budget))
    }
}

struct Call {
    outcome: CallOutcome,
    timing: Timing,
}

pub struct Orchestrator {
    config: RunnerConfig,
    store: ContractStore,
    audit: AuditLog,
    gate: DraftGate,
    breakers: CircuitBreakerEvaluator,
    worker: Arc<dyn Worker>,
    vcs: Box<dyn VersionControl>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    clocks: HashMap<String, PhaseClock>,
}

impl Orchestrator {
    pub fn new(
        config: RunnerConfig,
        worker: Arc<dyn Worker>,
        vcs: Box<dyn VersionControl>,
    ) -> Result<Self> {
        let gate = DraftGate::new(&config.gate).context("Failed to initialise draft gate")?;
        let store = ContractStore::open(&config.gate.state_dir)
            .context("Failed to open contract store")?;
        Ok(Self {
            audit: AuditLog::new(config.gate.transition_log_path()),
            breakers: CircuitBreakerEvaluator::new(&config.gate),
            store,
            gate,
            worker,
            vcs,
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            clocks: HashMap::new(),
            config,
        })
    }

    pub fn store(&self) -> &ContractStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn gate(&self) -> &DraftGate {
        &self.gate
    }

    /// Token that stops `run` at its next checkpoint.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle that wakes an idle `run` loop.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Create a contract from `proposal` and wake the loop.
    pub fn submit(&self, proposal: &TaskProposal) -> Result<TaskContract> {
        let contract = self
            .store
            .create(proposal, self.gate.validator(), &self.config.gate.workspace_root)
            .with_context(|| format!("Failed to create task {}", proposal.task_id))?;
        info!(task_id = %contract.task_id, complexity = ?contract.complexity, "Task submitted");
        self.notify.notify_one();
        Ok(contract)
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Run until cancelled, or a single pass when `once` is set.
    pub async fn run(&mut self, once: bool) -> Result<()> {
        if once {
            self.run_once().await?;
            return Ok(());
        }

        let mut poll = AdaptivePoll::from_config(&self.config.poll);
        info!(actor = %self.config.actor, "Orchestrator started");
        while !self.cancel.is_cancelled() {
            let advanced = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Orchestrator pass failed");
                    0
                }
            };
            if advanced > 0 {
                poll.on_activity();
                continue;
            }
            poll.on_idle();
            debug!(interval_ms = poll.current().as_millis() as u64, "Idle, waiting");
            if poll.wait(&self.notify, &self.cancel).await == WakeReason::Cancelled {
                break;
            }
        }
        info!("Orchestrator stopped");
        Ok(())
    }

    /// One pass over every active task. Returns how many advanced.
    pub async fn run_once(&mut self) -> Result<usize> {
        let tasks: Vec<String> = self
            .store
            .list_active()
            .context("Failed to list active contracts")?
            .into_iter()
            .map(|c| c.task_id)
            .collect();

        let mut advanced = 0;
        for task_id in tasks {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.step(&task_id).await {
                Ok(StepOutcome::Advanced) => advanced += 1,
                Ok(outcome) => debug!(task_id = %task_id, ?outcome, "Task not advanced"),
                // One task's failure never stops the others.
                Err(e) => error!(task_id = %task_id, error = %e, "Task step failed"),
            }
        }
        Ok(advanced)
    }

    /// Repeat passes until nothing advances or `max_passes` is reached.
    pub async fn run_until_idle(&mut self, max_passes: usize) -> Result<usize> {
        let mut passes = 0;
        while passes < max_passes && !self.cancel.is_cancelled() {
            passes += 1;
            if self.run_once().await? == 0 {
                break;
            }
        }
        Ok(passes)
    }

    /// Lock `task_id`, drive its current phase, release the lock.
    pub async fn step(&mut self, task_id: &str) -> Result<StepOutcome> {
        let current = self.store.load(task_id)?;
        let ttl = self.lock_ttl(&current);

        let mut contract = match self.store.acquire_lock(task_id, &self.config.actor, ttl) {
            Ok(c) => c,
            Err(GateError::LockHeld { holder, expires_at, .. }) => {
                debug!(task_id, holder = %holder, %expires_at, "Task locked elsewhere");
                return Ok(StepOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = self.drive(&mut contract).await;

        match self.store.release_lock(task_id, &self.config.actor) {
            Ok(_) | Err(GateError::NotFound { .. }) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to release task lock"),
        }
        outcome
    }

    fn lock_ttl(&self, contract: &TaskContract) -> Duration {
        let phase = contract
            .phase()
            .map(|p| contract.limits.timeouts.for_phase(p))
            .unwrap_or(Duration::from_secs(DEFAULT_LOCK_SECS));
        phase + self.config.lock_grace()
    }

    async fn drive(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        use TaskStatus as S;
        debug!(task_id = %contract.task_id, status = %contract.status, "Driving task");
        match contract.status {
            S::PendingImplementer | S::ImplementationInProgress => {
                self.implementation(contract).await
            }
            S::PendingLocalReview | S::LocalReviewInProgress => self.local_review(contract).await,
            S::PendingJudgeReview | S::JudgeReviewInProgress => self.judge_review(contract).await,
            S::PendingRebuttal | S::RebuttalInProgress => self.rebuttal(contract).await,
            S::TimeoutImplementation
            | S::TimeoutLocalReview
            | S::TimeoutJudgeReview
            | S::TimeoutRebuttal => self.timeout_retry(contract),
            S::ReviewComplete => self.merge(contract),
            S::Merged | S::ErikConsultation => {
                // Terminal but still active: a crash between save and archive.
                self.finish(contract, None, None)?;
                Ok(StepOutcome::Advanced)
            }
        }
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    async fn implementation(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        self.vcs
            .create_branch(&contract.task_id)
            .with_context(|| format!("Failed to create branch for {}", contract.task_id))?;
        // Drafts from an earlier call or attempt never carry over.
        self.gate.purge_task(&contract.task_id, &[]);
        if contract.status == TaskStatus::PendingImplementer {
            self.apply(
                contract,
                TaskEvent::ImplementerStarted,
                None,
                BreakerInput::default(),
                None,
            )?;
        }

        let content = prompts::implementation(contract);
        let tier = contract.complexity.implementer_tier();
        let call = self.call_worker(contract, WorkerRole::Implementer, tier, content).await;

        let response = match call.outcome {
            CallOutcome::TimedOut => {
                self.apply(
                    contract,
                    TaskEvent::ImplementationTimedOut,
                    None,
                    call.timing.timeout_input(),
                    None,
                )?;
                return Ok(StepOutcome::Advanced);
            }
            CallOutcome::Failed(e) => return self.worker_failed(contract, e, &call.timing),
            CallOutcome::Response(r) => r,
        };
        record_usage(contract, &response);

        let timing = call.timing;
        match response {
            WorkerResponse::Implementation(report) => self.gate_drafts(contract, report, &timing),
            WorkerResponse::Stalled(stall) => self.stalled(contract, &stall.reason, &timing),
            other => self.protocol_violation(contract, other.kind(), "implementation", &timing),
        }
    }

    /// Run every reported draft through the gate and record the combined
    /// outcome. Accepted drafts stay staged until the merge.
    fn gate_drafts(
        &mut self,
        contract: &mut TaskContract,
        report: ImplementationReport,
        timing: &Timing,
    ) -> Result<StepOutcome> {
        if !report.success {
            let reason = report
                .stall_reason
                .unwrap_or_else(|| "implementer reported failure".to_string());
            return self.stalled(contract, &reason, timing);
        }
        if report.drafts.is_empty() {
            return self.stalled(contract, "implementer submitted no drafts", timing);
        }

        let mut reported = report.drafts.clone();
        reported.sort();
        reported.dedup();

        let mut submissions = Vec::new();
        let mut refusals = Vec::new();
        for path in &reported {
            match self.gate.load_submission(Path::new(path)) {
                Ok(sub) if sub.task_id == contract.task_id => submissions.push(sub),
                Ok(sub) => refusals.push(format!("{path} belongs to task {}", sub.task_id)),
                Err(e) => refusals.push(format!("{path}: {e}")),
            }
        }
        // Staged but not reported: nobody will review it.
        self.gate.purge_task(&contract.task_id, &submissions);

        let decisions: Vec<(DraftSubmission, GateDecision)> = submissions
            .into_iter()
            .map(|sub| {
                let decision = self.gate.handle_with_constraints(&sub, &contract.constraints);
                (sub, decision)
            })
            .collect();
        let all_subs: Vec<DraftSubmission> = decisions.iter().map(|(s, _)| s.clone()).collect();
        let fresh_hash = artifact_hash(&all_subs);
        let merged_diff = decisions
            .iter()
            .fold(DiffSummary::default(), |acc, (_, d)| acc.merge(&d.diff_summary));

        if let Some((sub, decision)) = decisions
            .iter()
            .find(|(_, d)| d.decision == Decision::Escalate)
        {
            contract.handoff_data.escalated_drafts = decisions
                .iter()
                .filter(|(_, d)| d.decision == Decision::Escalate)
                .map(|(s, _)| s.submission_path())
                .collect();
            contract.handoff_data.diff_summary = Some(merged_diff);
            let detail = format!("draft for {}: {}", sub.original_path, decision.reason);
            let input = BreakerInput {
                diff_summary: Some(merged_diff),
                fresh_artifact_hash: Some(fresh_hash),
                phase_elapsed: timing.elapsed,
            };
            let hint = HaltTrigger::DraftEscalated {
                original_path: sub.original_path.clone(),
            };
            self.apply(contract, TaskEvent::Escalated, Some(&detail), input, Some(hint))?;
            return Ok(StepOutcome::Advanced);
        }

        refusals.extend(
            decisions
                .iter()
                .filter(|(_, d)| !d.is_accept())
                .map(|(s, d)| format!("{}: {}", s.original_path, d.reason)),
        );
        if !refusals.is_empty() {
            for (sub, decision) in &decisions {
                if decision.is_accept() {
                    self.gate.remove_artifacts(sub);
                }
            }
            let detail = refusals.join("; ");
            let input = BreakerInput {
                diff_summary: None,
                fresh_artifact_hash: (!all_subs.is_empty()).then_some(fresh_hash),
                phase_elapsed: timing.elapsed,
            };
            self.apply(contract, TaskEvent::DraftRejected, Some(&detail), input, None)?;
            return Ok(StepOutcome::Advanced);
        }

        let mut changed: Vec<String> = all_subs.iter().map(|s| s.original_path.clone()).collect();
        changed.sort();
        changed.dedup();
        let handoff = &mut contract.handoff_data;
        handoff.changed_files = changed;
        handoff.diff_summary = Some(merged_diff);
        handoff.artifact_hash = Some(fresh_hash.clone());
        handoff.stall_reason = None;
        handoff.rebuttal_text = None;

        let input = BreakerInput {
            diff_summary: Some(merged_diff),
            fresh_artifact_hash: Some(fresh_hash),
            phase_elapsed: timing.elapsed,
        };
        self.apply(contract, TaskEvent::ImplementationSubmitted, None, input, None)?;
        Ok(StepOutcome::Advanced)
    }

    async fn local_review(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        if contract.status == TaskStatus::PendingLocalReview {
            self.apply(
                contract,
                TaskEvent::LocalReviewStarted,
                None,
                BreakerInput::default(),
                None,
            )?;
        }

        let diff = self.reviewed_diff(contract);
        let content = prompts::local_review(contract, &diff);
        let call = self
            .call_worker(contract, WorkerRole::LocalReviewer, ModelTier::Strong, content)
            .await;

        let response = match call.outcome {
            CallOutcome::TimedOut => {
                self.apply(
                    contract,
                    TaskEvent::LocalReviewTimedOut,
                    None,
                    call.timing.timeout_input(),
                    None,
                )?;
                return Ok(StepOutcome::Advanced);
            }
            CallOutcome::Failed(e) => return self.worker_failed(contract, e, &call.timing),
            CallOutcome::Response(r) => r,
        };
        record_usage(contract, &response);

        match response {
            WorkerResponse::LocalReview(review) => {
                let cycle = contract.breaker.review_cycle_count() + 1;
                contract.handoff_data.local_verdict = Some(review.verdict);
                contract.handoff_data.review_findings.push(CycleFindings {
                    cycle,
                    source: ReviewSource::Local,
                    findings: review.findings,
                });
                let detail = format!("verdict {:?}", review.verdict);
                self.apply(
                    contract,
                    TaskEvent::LocalReviewCompleted,
                    Some(&detail),
                    call.timing.input(),
                    None,
                )?;
                Ok(StepOutcome::Advanced)
            }
            WorkerResponse::Stalled(stall) => self.stalled(contract, &stall.reason, &call.timing),
            other => self.protocol_violation(contract, other.kind(), "local_review", &call.timing),
        }
    }

    /// Consult `judge_panel_size` judges through the bounded pool. The panel
    /// passes only if every judge passes.
    async fn judge_review(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        if contract.status == TaskStatus::PendingJudgeReview {
            self.apply(
                contract,
                TaskEvent::JudgeReviewStarted,
                None,
                BreakerInput::default(),
                None,
            )?;
        }

        let diff = self.reviewed_diff(contract);
        let (elapsed, budget) = self.phase_budget(contract);
        let remaining = budget.saturating_sub(elapsed);
        let start = Instant::now();

        let panel = self.config.judge_panel_size.max(1);
        let results = if remaining.is_zero() {
            vec![Err(WorkerError::Timeout(budget.as_secs()))]
        } else {
            let request = WorkerRequest {
                task_id: contract.task_id.clone(),
                role: WorkerRole::Judge,
                model_tier: ModelTier::Strong,
                content: prompts::judge_review(contract, &diff),
                constraints: contract.constraints.clone(),
                timeout_seconds: remaining.as_secs().max(1),
            };
            let jobs: Vec<_> = (0..panel)
                .map(|_| {
                    let worker = self.worker.clone();
                    let request = request.clone();
                    async move {
                        match tokio::time::timeout(remaining, worker.invoke(&request)).await {
                            Ok(result) => result,
                            Err(_) => Err(WorkerError::Timeout(remaining.as_secs())),
                        }
                    }
                })
                .collect();
            run_bounded(self.config.max_parallel_workers, jobs).await.results
        };
        let timing = Timing {
            elapsed: elapsed + start.elapsed(),
            budget,
        };

        let mut responses = Vec::with_capacity(results.len());
        let mut failure = None;
        let mut timed_out = false;
        for result in results {
            match result {
                Ok(r) => {
                    record_usage(contract, &r);
                    responses.push(r);
                }
                Err(WorkerError::Timeout(_)) => timed_out = true,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if timed_out {
            self.apply(
                contract,
                TaskEvent::JudgeReviewTimedOut,
                None,
                timing.timeout_input(),
                None,
            )?;
            return Ok(StepOutcome::Advanced);
        }
        if let Some(e) = failure {
            return self.worker_failed(contract, e, &timing);
        }

        let mut passed = true;
        let mut findings = Vec::new();
        for response in responses {
            match response {
                WorkerResponse::JudgeReview(review) => {
                    passed &= review.verdict == JudgeVerdict::Pass;
                    findings.extend(review.findings);
                }
                WorkerResponse::Stalled(stall) => {
                    return self.stalled(contract, &stall.reason, &timing);
                }
                other => {
                    return self.protocol_violation(contract, other.kind(), "judge_review", &timing);
                }
            }
        }

        let cycle = contract.breaker.review_cycle_count() + 1;
        contract.handoff_data.review_findings.push(CycleFindings {
            cycle,
            source: ReviewSource::Judge,
            findings,
        });
        let (verdict, event) = if passed {
            (JudgeVerdict::Pass, TaskEvent::JudgeApproved)
        } else {
            (JudgeVerdict::Fail, TaskEvent::JudgeRejected)
        };
        contract.handoff_data.judge_verdict = Some(verdict);
        let detail = format!("{panel} judge(s)");
        self.apply(contract, event, Some(&detail), timing.input(), None)?;
        Ok(StepOutcome::Advanced)
    }

    async fn rebuttal(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        if contract.status == TaskStatus::PendingRebuttal {
            self.apply(
                contract,
                TaskEvent::RebuttalStarted,
                None,
                BreakerInput::default(),
                None,
            )?;
        }

        let content = prompts::rebuttal(contract);
        let tier = contract.complexity.implementer_tier();
        let call = self.call_worker(contract, WorkerRole::Rebutter, tier, content).await;

        let response = match call.outcome {
            CallOutcome::TimedOut => {
                self.apply(
                    contract,
                    TaskEvent::RebuttalTimedOut,
                    None,
                    call.timing.timeout_input(),
                    None,
                )?;
                return Ok(StepOutcome::Advanced);
            }
            CallOutcome::Failed(e) => return self.worker_failed(contract, e, &call.timing),
            CallOutcome::Response(r) => r,
        };
        record_usage(contract, &response);

        match response {
            WorkerResponse::Rebuttal(report) => match report.stance {
                RebuttalStance::Rebut { text } => {
                    contract.handoff_data.rebuttal_text = Some(text);
                    self.apply(
                        contract,
                        TaskEvent::RebuttalSubmitted,
                        None,
                        call.timing.input(),
                        None,
                    )?;
                    Ok(StepOutcome::Advanced)
                }
                RebuttalStance::Concede => {
                    self.gate.purge_task(&contract.task_id, &[]);
                    contract.handoff_data.rebuttal_text = None;
                    self.apply(
                        contract,
                        TaskEvent::RebuttalConceded,
                        None,
                        call.timing.input(),
                        None,
                    )?;
                    Ok(StepOutcome::Advanced)
                }
            },
            WorkerResponse::Stalled(stall) => self.stalled(contract, &stall.reason, &call.timing),
            other => self.protocol_violation(contract, other.kind(), "rebuttal", &call.timing),
        }
    }

    /// Retry a timed-out phase, or halt once the retries are spent.
    fn timeout_retry(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        let status = contract.status;
        let retries = contract
            .history
            .iter()
            .rev()
            .take_while(|h| h.event != TaskEvent::HumanReset)
            .filter(|h| h.event == TaskEvent::TimeoutRetry && h.from == status)
            .count() as u32;

        if retries < self.config.max_timeout_retries {
            let detail = format!("retry {} of {}", retries + 1, self.config.max_timeout_retries);
            self.apply(
                contract,
                TaskEvent::TimeoutRetry,
                Some(&detail),
                BreakerInput::default(),
                None,
            )?;
            return Ok(StepOutcome::Advanced);
        }

        let phase = status.phase().map(|p| p.to_string()).unwrap_or_default();
        let reason = format!("{phase} phase timed out {} times", retries + 1);
        contract.breaker.trip(BreakerTrigger::PhaseTimeout, reason.clone());
        let hint = HaltTrigger::Breaker {
            trigger: BreakerTrigger::PhaseTimeout,
        };
        self.apply(
            contract,
            TaskEvent::BreakerTripped,
            Some(&reason),
            BreakerInput::default(),
            Some(hint),
        )?;
        Ok(StepOutcome::Advanced)
    }

    /// Apply the reviewed drafts, commit, and merge the task branch.
    ///
    /// Only the drafts recorded at submission are merged, and only while
    /// they still hash to the reviewed artifact. Breakers are evaluated
    /// before the workspace is touched; the drafts are then applied as one
    /// batch and rolled back if the commit fails.
    fn merge(&mut self, contract: &mut TaskContract) -> Result<StepOutcome> {
        let task_id = contract.task_id.clone();
        self.vcs
            .create_branch(&task_id)
            .with_context(|| format!("Failed to switch to branch for {task_id}"))?;

        let submissions = match self.reviewed_submissions(contract) {
            Ok(subs) => subs,
            Err(reason) => return self.escalate(contract, &reason, HaltTrigger::MergeFailed),
        };
        self.gate.purge_task(&task_id, &submissions);

        let decisions: Vec<(DraftSubmission, GateDecision)> = submissions
            .iter()
            .map(|sub| {
                let d = self.gate.handle_with_constraints(sub, &contract.constraints);
                (sub.clone(), d)
            })
            .collect();
        if let Some((sub, decision)) = decisions.iter().find(|(_, d)| !d.is_accept()) {
            let detail = format!(
                "reviewed draft for {} no longer passes: {}",
                sub.original_path, decision.reason
            );
            let hint = HaltTrigger::DraftEscalated {
                original_path: sub.original_path.clone(),
            };
            return self.escalate(contract, &detail, hint);
        }

        let mut candidate = contract.clone();
        let advance = self.breakers.advance(
            &mut candidate,
            TaskEvent::MergeCompleted,
            None,
            &BreakerInput::default(),
            Utc::now(),
        )?;
        if candidate.status != TaskStatus::Merged {
            *contract = candidate;
            self.commit_transition(contract, advance, None, None)?;
            return Ok(StepOutcome::Advanced);
        }

        let applied = match self.gate.apply_all(&submissions, &contract.constraints) {
            Ok(applied) => applied,
            Err(e) => {
                let detail = format!("applying reviewed drafts failed: {e}");
                return self.escalate(contract, &detail, HaltTrigger::MergeFailed);
            }
        };
        if let Err(e) = self.vcs.checkpoint_commit(&format!("{task_id}: apply reviewed drafts")) {
            if let Err(restore) = self.gate.rollback(applied) {
                error!(task_id = %task_id, error = %restore, "Rollback after failed commit failed");
            }
            let detail = format!("commit failed: {e}");
            return self.escalate(contract, &detail, HaltTrigger::MergeFailed);
        }
        self.gate.finalize(applied);

        if let Err(e) = self.vcs.merge_to_main(&task_id) {
            let detail = format!("merge into {} failed: {e}", self.config.git.main_branch);
            return self.escalate(contract, &detail, HaltTrigger::MergeFailed);
        }
        *contract = candidate;
        self.commit_transition(contract, advance, None, None)?;
        Ok(StepOutcome::Advanced)
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    fn stalled(
        &mut self,
        contract: &mut TaskContract,
        reason: &str,
        timing: &Timing,
    ) -> Result<StepOutcome> {
        warn!(task_id = %contract.task_id, reason, "Worker stalled");
        contract.handoff_data.stall_reason = Some(reason.to_string());
        self.apply(
            contract,
            TaskEvent::Escalated,
            Some(reason),
            timing.input(),
            Some(HaltTrigger::WorkerStalled),
        )?;
        Ok(StepOutcome::Advanced)
    }

    fn escalate(
        &mut self,
        contract: &mut TaskContract,
        detail: &str,
        hint: HaltTrigger,
    ) -> Result<StepOutcome> {
        self.apply(
            contract,
            TaskEvent::Escalated,
            Some(detail),
            BreakerInput::default(),
            Some(hint),
        )?;
        Ok(StepOutcome::Advanced)
    }

    fn protocol_violation(
        &mut self,
        contract: &mut TaskContract,
        got: &str,
        expected: &str,
        timing: &Timing,
    ) -> Result<StepOutcome> {
        let reason = format!("worker answered {got} during {expected}");
        self.stalled(contract, &reason, timing)
    }

    /// Transient failures leave the task where it is; anything else halts.
    fn worker_failed(
        &mut self,
        contract: &mut TaskContract,
        error: WorkerError,
        timing: &Timing,
    ) -> Result<StepOutcome> {
        if error.is_retryable() {
            warn!(task_id = %contract.task_id, error = %error, "Worker call failed, deferring");
            // Keep any usage recorded before the failure.
            self.store.save(contract)?;
            return Ok(StepOutcome::Deferred);
        }
        self.stalled(contract, &error.to_string(), timing)
    }

    /// Evaluate `event` through the breakers and record the result.
    fn apply(
        &mut self,
        contract: &mut TaskContract,
        event: TaskEvent,
        detail: Option<&str>,
        input: BreakerInput,
        hint: Option<HaltTrigger>,
    ) -> Result<()> {
        let advance = self
            .breakers
            .advance(contract, event, detail, &input, Utc::now())?;
        self.commit_transition(contract, advance, hint, detail)
    }

    /// Save, log and checkpoint an applied transition, then finish the
    /// attempt if it ended.
    fn commit_transition(
        &mut self,
        contract: &mut TaskContract,
        advance: Advance,
        hint: Option<HaltTrigger>,
        detail: Option<&str>,
    ) -> Result<()> {
        self.store.save(contract)?;
        self.audit.append_all(&advance.entries)?;

        if let (Some(first), Some(last)) = (advance.entries.first(), advance.entries.last()) {
            info!(
                task_id = %contract.task_id,
                from = %first.old_status,
                to = %last.new_status,
                event = %last.event,
                "Task transitioned"
            );
            self.checkpoint(&contract.task_id, &advance.entries);
        }

        if contract.status.is_terminal() {
            let trigger = advance
                .tripped
                .as_ref()
                .map(|t| HaltTrigger::Breaker { trigger: t.trigger })
                .or(hint);
            let reason = advance
                .tripped
                .map(|t| t.reason)
                .or_else(|| detail.map(str::to_string));
            self.finish(contract, trigger, reason)?;
        }
        Ok(())
    }

    fn checkpoint(&self, task_id: &str, entries: &[TransitionLogEntry]) {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return;
        };
        let message = format!("{task_id}: {} -> {}", first.old_status, last.new_status);
        if let Err(e) = self.vcs.checkpoint_commit(&message) {
            warn!(task_id, error = %e, "Checkpoint commit failed");
        }
    }

    /// Close out a terminal attempt: halt report for consultations, then
    /// archive.
    fn finish(
        &mut self,
        contract: &TaskContract,
        trigger: Option<HaltTrigger>,
        reason: Option<String>,
    ) -> Result<()> {
        self.clocks.remove(&contract.task_id);

        if contract.status == TaskStatus::ErikConsultation {
            let fresh = trigger.is_some();
            let trigger = trigger.unwrap_or_else(|| match contract.breaker.trigger() {
                Some(trigger) => HaltTrigger::Breaker { trigger },
                None => HaltTrigger::WorkerStalled,
            });
            let reason = reason.unwrap_or_else(|| contract.status_reason.clone());
            let report = HaltReport::build(contract, trigger, reason, Utc::now());
            if fresh || !self.store.halts_dir().join(report.file_name()).exists() {
                report.write(self.store.halts_dir())?;
            }
        }

        let path = self.store.archive(contract)?;
        info!(
            task_id = %contract.task_id,
            status = %contract.status,
            attempt = contract.attempt,
            archive = %path.display(),
            "Attempt finished"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker calls
    // ------------------------------------------------------------------

    /// Time spent in the current phase and the phase budget.
    ///
    /// Measured on the monotonic clock while this process has watched the
    /// phase; seeded from the persisted wall-clock start after a restart.
    fn phase_budget(&mut self, contract: &TaskContract) -> (Duration, Duration) {
        let budget = contract
            .phase()
            .map(|p| contract.limits.timeouts.for_phase(p))
            .unwrap_or_default();

        let elapsed = match self.clocks.get(&contract.task_id) {
            Some(clock) if clock.started_at == contract.phase_started_at => clock.instant.elapsed(),
            _ => {
                let wall = contract.phase_elapsed_at(Utc::now());
                let now = Instant::now();
                self.clocks.insert(
                    contract.task_id.clone(),
                    PhaseClock {
                        started_at: contract.phase_started_at,
                        instant: now.checked_sub(wall).unwrap_or(now),
                    },
                );
                wall
            }
        };
        (elapsed, budget)
    }

    /// Invoke the worker, bounded by what is left of the phase budget.
    async fn call_worker(
        &mut self,
        contract: &TaskContract,
        role: WorkerRole,
        tier: ModelTier,
        content: String,
    ) -> Call {
        let (elapsed, budget) = self.phase_budget(contract);
        let remaining = budget.saturating_sub(elapsed);
        if remaining.is_zero() {
            return Call {
                outcome: CallOutcome::TimedOut,
                timing: Timing { elapsed, budget },
            };
        }

        let request = WorkerRequest {
            task_id: contract.task_id.clone(),
            role,
            model_tier: tier,
            content,
            constraints: contract.constraints.clone(),
            timeout_seconds: remaining.as_secs().max(1),
        };
        debug!(
            task_id = %contract.task_id,
            %role,
            %tier,
            remaining_secs = remaining.as_secs(),
            "Calling worker"
        );

        let start = Instant::now();
        let outcome = match tokio::time::timeout(remaining, self.worker.invoke(&request)).await {
            Err(_) | Ok(Err(WorkerError::Timeout(_))) => CallOutcome::TimedOut,
            Ok(Err(e)) => CallOutcome::Failed(e),
            Ok(Ok(response)) => CallOutcome::Response(response),
        };
        if matches!(outcome, CallOutcome::TimedOut) {
            warn!(
                task_id = %contract.task_id,
                %role,
                budget_secs = budget.as_secs(),
                "Worker call timed out"
            );
        }
        Call {
            outcome,
            timing: Timing {
                elapsed: elapsed + start.elapsed(),
                budget,
            },
        }
    }

    /// The drafts recorded at submission: one per changed file, loaded by
    /// name and still matching the recorded artifact hash.
    fn reviewed_submissions(
        &self,
        contract: &TaskContract,
    ) -> std::result::Result<Vec<DraftSubmission>, String> {
        let handoff = &contract.handoff_data;
        if handoff.changed_files.is_empty() {
            return Err("no reviewed drafts to merge".to_string());
        }

        let mut subs = Vec::with_capacity(handoff.changed_files.len());
        for path in &handoff.changed_files {
            let (_, name) = artifact_names(&contract.task_id, path).map_err(|e| e.to_string())?;
            let sub = self
                .gate
                .load_submission(Path::new(&name))
                .map_err(|e| format!("reviewed draft for {path} is unavailable: {e}"))?;
            if sub.task_id != contract.task_id || sub.original_path != *path {
                return Err(format!(
                    "draft slot {name} holds {} of task {}",
                    sub.original_path, sub.task_id
                ));
            }
            subs.push(sub);
        }

        if handoff.artifact_hash.as_deref() != Some(artifact_hash(&subs).as_str()) {
            return Err("staged drafts no longer match the reviewed artifact".to_string());
        }
        Ok(subs)
    }

    /// Unified diff of the drafts under review.
    fn reviewed_diff(&self, contract: &TaskContract) -> String {
        let subs = match self.reviewed_submissions(contract) {
            Ok(subs) => subs,
            Err(reason) => {
                warn!(task_id = %contract.task_id, reason = %reason, "No reviewable drafts");
                return String::new();
            }
        };
        subs.iter()
            .filter_map(|sub| match self.gate.preview(sub) {
                Ok(diff) => Some(diff),
                Err(e) => {
                    warn!(
                        task_id = %contract.task_id,
                        original = %sub.original_path,
                        error = %e,
                        "No preview"
                    );
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn record_usage(contract: &mut TaskContract, response: &WorkerResponse) {
    let usage = response.usage();
    contract.breaker.record_usage(usage.tokens, usage.cost_usd);
}
