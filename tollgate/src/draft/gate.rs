//! Draft gate: the only path from a worker's draft to a production file.
//!
//! Workers never write production files. They stage a draft plus a
//! submission record in the sandbox; the gate re-validates both, diffs and
//! scans the draft, and only then swaps it in with an atomic rename.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::diff::{DiffSummary, LineDiff};
use super::scan::{SafetyScanner, ScanFinding};
use crate::breaker::PathScope;
use crate::config::GateConfig;
use crate::contract::types::Constraints;
use crate::error::{GateError, GateResult};
use crate::fsutil::{atomic_write, content_hash, sanitize_task_id};
use crate::sandbox::{PathCheck, SandboxValidator};

const DRAFT_SUFFIX: &str = ".draft";
const SUBMISSION_SUFFIX: &str = ".submission.json";
const KEY_SEPARATOR: &str = "__";

/// A staged draft awaiting the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DraftSubmission {
    pub task_id: String,
    /// Sandbox-relative path of the draft content.
    pub draft_path: String,
    /// Workspace-relative path of the file the draft replaces.
    pub original_path: String,
    pub original_hash: String,
    pub draft_hash: String,
    pub change_summary: String,
    pub submitted_at: DateTime<Utc>,
}

impl DraftSubmission {
    /// Sandbox-relative path of this submission's record.
    pub fn submission_path(&self) -> String {
        let stem = self
            .draft_path
            .strip_suffix(DRAFT_SUFFIX)
            .unwrap_or(&self.draft_path);
        format!("{stem}{SUBMISSION_SUFFIX}")
    }
}

/// Task segment of artifact names. Underscores become `-`, so the first
/// `__` in a name always ends the segment.
fn artifact_key(task_id: &str) -> String {
    sanitize_task_id(task_id).replace('_', "-")
}

fn is_task_artifact(name: &str, key: &str) -> bool {
    name.split_once(KEY_SEPARATOR)
        .is_some_and(|(segment, _)| segment == key)
}

/// Artifact names for a task's draft of `original_path`.
pub fn artifact_names(task_id: &str, original_path: &str) -> GateResult<(String, String)> {
    let file_name = Path::new(original_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| GateError::validation(original_path, "no file name"))?;
    let base = format!("{}{KEY_SEPARATOR}{file_name}", artifact_key(task_id));
    Ok((
        format!("{base}{DRAFT_SUFFIX}"),
        format!("{base}{SUBMISSION_SUFFIX}"),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Accept,
    Reject,
    Escalate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Reject => write!(f, "REJECT"),
            Self::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// The gate's verdict on one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub decision: Decision,
    pub reason: String,
    pub original_path: String,
    pub diff_summary: DiffSummary,
    /// Safety findings behind a rejection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<ScanFinding>,
    /// Unified diff for reviewers; empty when the gate stopped before diffing.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unified_diff: String,
}

impl GateDecision {
    fn new(decision: Decision, original_path: &str, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
            original_path: original_path.to_string(),
            diff_summary: DiffSummary::default(),
            findings: Vec::new(),
            unified_diff: String::new(),
        }
    }

    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    /// The target already holds the draft content.
    AlreadyApplied,
}

/// Result of [`DraftGate::process`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub decision: GateDecision,
    pub applied: Option<ApplyOutcome>,
}

/// Targets replaced by [`DraftGate::apply_all`] and their prior content.
///
/// Hand it back to [`DraftGate::finalize`] once the change is committed, or
/// to [`DraftGate::rollback`] to put the originals back.
#[derive(Debug)]
#[must_use = "applied drafts must be finalized or rolled back"]
pub struct AppliedDrafts {
    restore: Vec<(PathBuf, Vec<u8>)>,
    submissions: Vec<DraftSubmission>,
}

impl AppliedDrafts {
    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }
}

/// Diff, scan and apply worker drafts.
pub struct DraftGate {
    config: GateConfig,
    validator: SandboxValidator,
    scanner: SafetyScanner,
}

impl DraftGate {
    pub fn new(config: &GateConfig) -> GateResult<Self> {
        Ok(Self {
            validator: SandboxValidator::new(config)?,
            scanner: SafetyScanner::new(&config.extra_secret_patterns)?,
            config: config.clone(),
        })
    }

    pub fn validator(&self) -> &SandboxValidator {
        &self.validator
    }

    /// Stage `content` as a draft of `original_path` for `task_id`.
    pub fn stage_draft(
        &self,
        task_id: &str,
        original_path: &str,
        content: &str,
        change_summary: &str,
    ) -> GateResult<DraftSubmission> {
        let original = self
            .validator
            .validate_read(Path::new(original_path), &self.config.workspace_root)
            .into_result(original_path)?;
        let original_hash = content_hash(&fs::read(&original)?);

        let (draft_name, submission_name) = artifact_names(task_id, original_path)?;
        let draft_abs = self
            .validator
            .validate_write(Path::new(&draft_name))
            .into_result(&draft_name)?;
        let submission_abs = self
            .validator
            .validate_write(Path::new(&submission_name))
            .into_result(&submission_name)?;

        // Same file name in two directories would share artifacts.
        if let Ok(existing) = self.load_submission(Path::new(&submission_name)) {
            if existing.original_path != original_path {
                return Err(GateError::conflict(
                    task_id,
                    format!(
                        "draft slot {submission_name} already holds {}",
                        existing.original_path
                    ),
                ));
            }
        }

        let submission = DraftSubmission {
            task_id: task_id.to_string(),
            draft_path: draft_name,
            original_path: original_path.to_string(),
            original_hash,
            draft_hash: content_hash(content.as_bytes()),
            change_summary: change_summary.to_string(),
            submitted_at: Utc::now(),
        };

        atomic_write(&draft_abs, content.as_bytes())?;
        atomic_write(&submission_abs, &serde_json::to_vec_pretty(&submission)?)?;

        debug!(
            task_id,
            original = original_path,
            draft = %submission.draft_path,
            "Staged draft"
        );
        Ok(submission)
    }

    /// Read a submission record from the sandbox. Unknown fields are refused.
    pub fn load_submission(&self, relative: &Path) -> GateResult<DraftSubmission> {
        let path = self.validator.resolve_in_sandbox(relative)?;
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every sandbox artifact (drafts and records) staged for `task_id`.
    pub fn task_artifacts(&self, task_id: &str) -> GateResult<Vec<String>> {
        let key = artifact_key(task_id);
        let root = self.validator.sandbox_root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<String> = fs::read_dir(root)?
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| is_task_artifact(n, &key))
            .collect();
        found.sort();
        Ok(found)
    }

    /// Submission records currently staged for `task_id`.
    pub fn pending_submissions(&self, task_id: &str) -> GateResult<Vec<String>> {
        Ok(self
            .task_artifacts(task_id)?
            .into_iter()
            .filter(|n| n.ends_with(SUBMISSION_SUFFIX))
            .collect())
    }

    /// Delete every artifact staged for `task_id` except those of `keep`.
    /// Returns how many files were removed.
    pub fn purge_task(&self, task_id: &str, keep: &[DraftSubmission]) -> usize {
        let kept: HashSet<String> = keep
            .iter()
            .flat_map(|s| [s.draft_path.clone(), s.submission_path()])
            .collect();
        let names = match self.task_artifacts(task_id) {
            Ok(names) => names,
            Err(e) => {
                warn!(task_id, error = %e, "Failed to list staged artifacts");
                return 0;
            }
        };

        let mut removed = 0;
        for name in names.iter().filter(|n| !kept.contains(*n)) {
            match self.validator.resolve_in_sandbox(Path::new(name)) {
                Ok(path) => match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(artifact = %name, error = %e, "Failed to purge artifact"),
                },
                Err(e) => warn!(artifact = %name, error = %e, "Refusing to purge artifact"),
            }
        }
        if removed > 0 {
            info!(task_id, removed, "Purged unreviewed draft artifacts");
        }
        removed
    }

    /// Judge a submission with default constraints.
    pub fn handle_draft_submission(&self, submission: &DraftSubmission) -> GateDecision {
        self.handle_with_constraints(submission, &Constraints::default())
    }

    /// Judge a submission and carry out the disposition: a rejection deletes
    /// the artifacts; an escalation keeps them.
    pub fn handle_with_constraints(
        &self,
        submission: &DraftSubmission,
        constraints: &Constraints,
    ) -> GateDecision {
        let decision = self.decide(submission, constraints);
        match decision.decision {
            Decision::Accept => {
                info!(
                    task_id = %submission.task_id,
                    original = %submission.original_path,
                    added = decision.diff_summary.lines_added,
                    deleted = decision.diff_summary.lines_deleted,
                    "Draft accepted"
                );
            }
            Decision::Reject => {
                warn!(
                    task_id = %submission.task_id,
                    original = %submission.original_path,
                    reason = %decision.reason,
                    "Draft rejected"
                );
                self.remove_artifacts(submission);
            }
            Decision::Escalate => {
                warn!(
                    task_id = %submission.task_id,
                    original = %submission.original_path,
                    reason = %decision.reason,
                    "Draft escalated; artifacts retained"
                );
            }
        }
        decision
    }

    fn decide(&self, sub: &DraftSubmission, constraints: &Constraints) -> GateDecision {
        let reject = |reason: String| GateDecision::new(Decision::Reject, &sub.original_path, reason);

        // 1. Both paths again, from scratch.
        match artifact_names(&sub.task_id, &sub.original_path) {
            Ok((expected, _)) if expected == sub.draft_path => {}
            _ => {
                return reject(format!(
                    "draft path {} is not the artifact of task {} for {}",
                    sub.draft_path, sub.task_id, sub.original_path
                ))
            }
        }
        let draft_abs = match self.validator.validate_write(Path::new(&sub.draft_path)) {
            PathCheck::Allowed(p) => p,
            PathCheck::Blocked(r) => return reject(format!("draft path refused: {r}")),
        };
        let original_abs = match self
            .validator
            .validate_read(Path::new(&sub.original_path), &self.config.workspace_root)
        {
            PathCheck::Allowed(p) => p,
            PathCheck::Blocked(r) => return reject(format!("original path refused: {r}")),
        };
        match PathScope::from_constraints(constraints) {
            Ok(scope) => {
                if let Some(violation) = scope.violation(&sub.original_path) {
                    return reject(format!("out of scope: {violation}"));
                }
            }
            Err(e) => return reject(format!("path constraints unusable: {e}")),
        }

        // 2. Draft still what was submitted.
        let draft_bytes = match fs::read(&draft_abs) {
            Ok(b) => b,
            Err(e) => return reject(format!("draft unreadable: {e}")),
        };
        if content_hash(&draft_bytes) != sub.draft_hash {
            return reject("draft content does not match draft_hash (tampered)".to_string());
        }
        let Ok(draft_text) = String::from_utf8(draft_bytes) else {
            return reject("draft is not UTF-8 text".to_string());
        };

        // 3. Target unchanged since the draft was requested.
        let original_bytes = match fs::read(&original_abs) {
            Ok(b) => b,
            Err(e) => return reject(format!("original unreadable: {e}")),
        };
        let on_disk = content_hash(&original_bytes);
        if on_disk != sub.original_hash {
            return GateDecision::new(
                Decision::Escalate,
                &sub.original_path,
                format!(
                    "conflict: {} changed since the draft was requested",
                    sub.original_path
                ),
            );
        }
        let Ok(original_text) = String::from_utf8(original_bytes) else {
            return reject("original is not UTF-8 text".to_string());
        };

        // 4.
        let diff = LineDiff::compute(&original_text, &draft_text);
        let summary = diff.summary();
        let unified = diff.unified(&sub.original_path);
        let with_diff = |decision: Decision, reason: String| GateDecision {
            diff_summary: summary,
            unified_diff: unified.clone(),
            ..GateDecision::new(decision, &sub.original_path, reason)
        };

        // 5.
        let findings = self.scanner.scan(diff.added_lines());
        if !findings.is_empty() {
            let secret = findings.iter().any(|f| f.category.is_secret());
            let kinds: Vec<String> = findings.iter().map(|f| f.category.to_string()).collect();
            let mut decision = with_diff(
                Decision::Reject,
                format!(
                    "{} in added lines ({})",
                    if secret {
                        "secret detection"
                    } else {
                        "machine-specific path"
                    },
                    kinds.join(", ")
                ),
            );
            decision.findings = findings;
            return decision;
        }

        if !constraints.allow_deletions && draft_text.trim().is_empty() && summary.original_lines > 0
        {
            return with_diff(
                Decision::Reject,
                "draft empties the file and deletions are not allowed".to_string(),
            );
        }

        // 6. The threshold itself escalates.
        if summary.deletion_ratio >= self.config.max_delete_ratio {
            return with_diff(
                Decision::Escalate,
                format!(
                    "deletion ratio {:.2} at or above {:.2} ({} of {} lines)",
                    summary.deletion_ratio,
                    self.config.max_delete_ratio,
                    summary.lines_deleted,
                    summary.original_lines
                ),
            );
        }

        // 7.
        let scope_limit = self.config.max_draft_lines.min(constraints.max_diff_lines);
        if summary.changed_lines() > scope_limit {
            return with_diff(
                Decision::Escalate,
                format!(
                    "{} changed lines exceed the scope limit of {scope_limit}",
                    summary.changed_lines()
                ),
            );
        }

        with_diff(Decision::Accept, "passed all gate checks".to_string())
    }

    /// Unified diff of a staged draft against the current target, for
    /// reviewers. Touches nothing.
    pub fn preview(&self, submission: &DraftSubmission) -> GateResult<String> {
        let original = self
            .validator
            .validate_read(
                Path::new(&submission.original_path),
                &self.config.workspace_root,
            )
            .into_result(&submission.original_path)?;
        let draft = self
            .validator
            .resolve_in_sandbox(Path::new(&submission.draft_path))?;
        let old = fs::read_to_string(&original)?;
        let new = fs::read_to_string(&draft)?;
        Ok(LineDiff::compute(&old, &new).unified(&submission.original_path))
    }

    /// Gate `submission` again and swap it into place on ACCEPT.
    ///
    /// A second call finds the target already at `draft_hash` and returns
    /// `AlreadyApplied` without touching it. Anything short of ACCEPT is an
    /// error and leaves the target alone.
    pub fn apply(
        &self,
        submission: &DraftSubmission,
        constraints: &Constraints,
    ) -> GateResult<ApplyOutcome> {
        let original_abs = self.target_path(submission)?;
        let on_disk = content_hash(&fs::read(&original_abs)?);
        if on_disk == submission.draft_hash {
            debug!(original = %submission.original_path, "Draft already applied");
            self.remove_artifacts(submission);
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if on_disk != submission.original_hash {
            return Err(GateError::conflict(
                &submission.task_id,
                format!("{} changed since the draft was requested", submission.original_path),
            ));
        }

        let decision = self.decide(submission, constraints);
        if !decision.is_accept() {
            return Err(not_accepted(&decision));
        }
        self.write_accepted(submission)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Handle, then apply on ACCEPT.
    pub fn process(
        &self,
        submission: &DraftSubmission,
        constraints: &Constraints,
    ) -> GateResult<ProcessOutcome> {
        let decision = self.handle_with_constraints(submission, constraints);
        let applied = if decision.is_accept() {
            self.write_accepted(submission)?;
            Some(ApplyOutcome::Applied)
        } else {
            None
        };
        Ok(ProcessOutcome { decision, applied })
    }

    /// Apply a set of drafts all-or-nothing.
    ///
    /// Every draft is gated again and every target checked against its
    /// `original_hash` before the first write. If a write fails, the targets
    /// already replaced are restored and the error is returned. Artifacts
    /// stay staged until [`DraftGate::finalize`].
    pub fn apply_all(
        &self,
        submissions: &[DraftSubmission],
        constraints: &Constraints,
    ) -> GateResult<AppliedDrafts> {
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(submissions.len());
        for sub in submissions {
            if !seen.insert(sub.original_path.as_str()) {
                return Err(GateError::validation(
                    &sub.original_path,
                    "more than one draft targets this file",
                ));
            }
            let target = self.target_path(sub)?;
            let original = fs::read(&target)?;
            if content_hash(&original) != sub.original_hash {
                return Err(GateError::conflict(
                    &sub.task_id,
                    format!("{} changed since the draft was requested", sub.original_path),
                ));
            }
            let decision = self.decide(sub, constraints);
            if !decision.is_accept() {
                return Err(not_accepted(&decision));
            }
            let content = self.read_draft(sub)?;
            planned.push((target, original, content));
        }

        let mut restore = Vec::with_capacity(planned.len());
        for (target, original, content) in planned {
            if let Err(e) = atomic_write(&target, &content) {
                warn!(target = %target.display(), error = %e, "Draft write failed, restoring");
                if let Err(restore_err) = restore_files(&restore) {
                    error!(error = %restore_err, "Failed to restore targets after a failed apply");
                }
                return Err(e.into());
            }
            restore.push((target, original));
        }

        info!(count = restore.len(), "Drafts applied");
        Ok(AppliedDrafts {
            restore,
            submissions: submissions.to_vec(),
        })
    }

    /// Drop the artifacts of a committed batch.
    pub fn finalize(&self, applied: AppliedDrafts) {
        for sub in &applied.submissions {
            self.remove_artifacts(sub);
        }
    }

    /// Put back what [`DraftGate::apply_all`] replaced. The artifacts stay
    /// staged.
    pub fn rollback(&self, applied: AppliedDrafts) -> GateResult<()> {
        restore_files(&applied.restore)?;
        warn!(count = applied.restore.len(), "Applied drafts rolled back");
        Ok(())
    }

    /// Write an accepted draft over its target and drop its artifacts.
    pub(crate) fn write_accepted(&self, submission: &DraftSubmission) -> GateResult<()> {
        let original_abs = self.target_path(submission)?;
        if content_hash(&fs::read(&original_abs)?) != submission.original_hash {
            return Err(GateError::conflict(
                &submission.task_id,
                format!("{} changed since the draft was requested", submission.original_path),
            ));
        }
        let content = self.read_draft(submission)?;
        atomic_write(&original_abs, &content)?;
        self.remove_artifacts(submission);

        info!(
            task_id = %submission.task_id,
            original = %submission.original_path,
            "Draft applied"
        );
        Ok(())
    }

    fn target_path(&self, submission: &DraftSubmission) -> GateResult<PathBuf> {
        self.validator
            .validate_read(
                Path::new(&submission.original_path),
                &self.config.workspace_root,
            )
            .into_result(&submission.original_path)
    }

    /// Draft bytes, checked against `draft_hash`.
    fn read_draft(&self, submission: &DraftSubmission) -> GateResult<Vec<u8>> {
        let draft_abs = self
            .validator
            .resolve_in_sandbox(Path::new(&submission.draft_path))?;
        let content = fs::read(&draft_abs)?;
        if content_hash(&content) != submission.draft_hash {
            return Err(GateError::validation(
                &draft_abs,
                "draft content does not match draft_hash",
            ));
        }
        Ok(content)
    }

    /// Remove a submission's sandbox artifacts. Paths that fail containment
    /// are left alone.
    pub fn remove_artifacts(&self, submission: &DraftSubmission) {
        for rel in [submission.draft_path.clone(), submission.submission_path()] {
            match self.validator.resolve_in_sandbox(Path::new(&rel)) {
                Ok(path) => {
                    if let Err(e) = fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %e, "Failed to remove draft artifact");
                        }
                    }
                }
                Err(e) => warn!(artifact = %rel, error = %e, "Refusing to remove artifact"),
            }
        }
    }

    /// Absolute sandbox path of a staged artifact.
    pub fn artifact_path(&self, relative: &str) -> GateResult<PathBuf> {
        self.validator.resolve_in_sandbox(Path::new(relative))
    }
}

fn not_accepted(decision: &GateDecision) -> GateError {
    GateError::validation(
        &decision.original_path,
        format!("gate answered {}: {}", decision.decision, decision.reason),
    )
}

fn restore_files(written: &[(PathBuf, Vec<u8>)]) -> std::io::Result<()> {
    let mut first_err = None;
    for (path, bytes) in written.iter().rev() {
        if let Err(e) = atomic_write(path, bytes) {
            error!(path = %path.display(), error = %e, "Failed to restore file");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Combined hash of a set of drafts: BLAKE3 over the sorted
/// `original_path=draft_hash` lines.
pub fn artifact_hash(submissions: &[DraftSubmission]) -> String {
    let mut lines: Vec<String> = submissions
        .iter()
        .map(|s| format!("{}={}", s.original_path, s.draft_hash))
        .collect();
    lines.sort();
    content_hash(lines.join("\n").as_bytes())
}
