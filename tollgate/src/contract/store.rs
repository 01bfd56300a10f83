//! Durable contract store.
//!
//! Layout under the state directory:
//!
//! ```text
//! contracts/<task>.json              active records, rewritten atomically
//! archive/<task>.attempt-<n>.json    terminal snapshots, create-new + read-only
//! halts/<task>.attempt-<n>.json      halt reports
//! ```
//!
//! Writes use optimistic concurrency on `version`. A process-wide mutex
//! serializes the read-check-write so two callers in one process cannot both
//! pass the version check.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::types::{
    Limits, SourceArtifact, Specification, TaskContract, TaskLock, TaskProposal, TaskStatus,
};
use crate::audit::TransitionLogEntry;
use crate::error::{GateError, GateResult};
use crate::fsutil::{
    atomic_write, content_hash, recover_interrupted_writes, sanitize_task_id, write_immutable,
    TMP_SUFFIX,
};
use crate::sandbox::SandboxValidator;
use crate::state_machine::{apply_event_with_reason, TaskEvent};

pub struct ContractStore {
    state_dir: PathBuf,
    contracts_dir: PathBuf,
    archive_dir: PathBuf,
    halts_dir: PathBuf,
    write_guard: Mutex<()>,
}

impl ContractStore {
    /// Open (creating if needed) the store under `state_dir` and clear out
    /// interrupted writes.
    pub fn open(state_dir: impl AsRef<Path>) -> GateResult<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let contracts_dir = state_dir.join("contracts");
        let archive_dir = state_dir.join("archive");
        let halts_dir = state_dir.join("halts");
        for dir in [&contracts_dir, &archive_dir, &halts_dir] {
            fs::create_dir_all(dir)?;
        }

        let recovered =
            recover_interrupted_writes(&contracts_dir) + recover_interrupted_writes(&halts_dir);
        if recovered > 0 {
            warn!(count = recovered, "Removed interrupted contract writes");
        }

        Ok(Self {
            state_dir,
            contracts_dir,
            archive_dir,
            halts_dir,
            write_guard: Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn halts_dir(&self) -> &Path {
        &self.halts_dir
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_guard.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn active_path(&self, task_id: &str) -> PathBuf {
        self.contracts_dir
            .join(format!("{}.json", sanitize_task_id(task_id)))
    }

    fn archive_path(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.archive_dir.join(format!(
            "{}.attempt-{attempt}.json",
            sanitize_task_id(task_id)
        ))
    }

    // ------------------------------------------------------------------
    // Active records
    // ------------------------------------------------------------------

    /// Create a contract from an external proposal.
    ///
    /// Every source path and the target path must pass `validate_read`;
    /// sources are hashed into the specification.
    pub fn create(
        &self,
        proposal: &TaskProposal,
        validator: &SandboxValidator,
        workspace_root: &Path,
    ) -> GateResult<TaskContract> {
        self.create_at(proposal, validator, workspace_root, Utc::now())
    }

    pub fn create_at(
        &self,
        proposal: &TaskProposal,
        validator: &SandboxValidator,
        workspace_root: &Path,
        now: DateTime<Utc>,
    ) -> GateResult<TaskContract> {
        if proposal.task_id.trim().is_empty() {
            return Err(GateError::validation(
                &proposal.target_path,
                "task_id must not be empty",
            ));
        }
        if let Some(limits) = &proposal.limits {
            validate_limits(limits)?;
        }

        validator
            .validate_read(Path::new(&proposal.target_path), workspace_root)
            .into_result(&proposal.target_path)?;

        let mut source_artifacts = Vec::with_capacity(proposal.source_paths.len());
        for source in &proposal.source_paths {
            let resolved = validator
                .validate_read(Path::new(source), workspace_root)
                .into_result(source)?;
            source_artifacts.push(SourceArtifact {
                path: source.clone(),
                content_hash: content_hash(&fs::read(&resolved)?),
            });
        }

        let specification = Specification {
            source_artifacts,
            target_path: proposal.target_path.clone(),
            requirements: proposal.requirements.clone(),
            acceptance_criteria: proposal.acceptance_criteria.clone(),
        };
        let mut contract =
            TaskContract::new(&proposal.task_id, proposal.complexity, specification, now);
        if let Some(limits) = &proposal.limits {
            contract.limits = limits.clone();
        }
        if let Some(constraints) = &proposal.constraints {
            contract.constraints = constraints.clone();
        }

        let _guard = self.guard();
        let path = self.active_path(&contract.task_id);
        if path.exists() {
            return Err(GateError::already_exists(format!(
                "contract {}",
                contract.task_id
            )));
        }
        if self.latest_archived(&contract.task_id)?.is_some() {
            return Err(GateError::already_exists(format!(
                "archived contract {} (use reset to start a new attempt)",
                contract.task_id
            )));
        }
        contract.version = 1;
        self.write_record(&path, &contract)?;

        info!(
            task_id = %contract.task_id,
            complexity = ?contract.complexity,
            sources = contract.specification.source_artifacts.len(),
            "Contract created"
        );
        Ok(contract)
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.active_path(task_id).is_file()
    }

    pub fn load(&self, task_id: &str) -> GateResult<TaskContract> {
        let path = self.active_path(task_id);
        let contract = read_record(&path).map_err(|e| match e {
            GateError::Io(io) if io.kind() == ErrorKind::NotFound => {
                GateError::not_found(format!("contract {task_id}"))
            }
            other => other,
        })?;
        if contract.task_id != task_id {
            // Two ids that sanitize to the same file name.
            return Err(GateError::conflict(
                task_id,
                format!("record file belongs to task {}", contract.task_id),
            ));
        }
        Ok(contract)
    }

    /// All active contracts, ordered by task id. Unreadable records are
    /// logged and skipped.
    pub fn list_active(&self) -> GateResult<Vec<TaskContract>> {
        let mut contracts: Vec<TaskContract> = json_files(&self.contracts_dir)?
            .into_iter()
            .filter_map(|path| match read_record(&path) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable contract");
                    None
                }
            })
            .collect();
        contracts.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(contracts)
    }

    /// Persist `contract`, failing with `Conflict` if the stored version moved
    /// on since it was read. Bumps `contract.version` on success.
    pub fn save(&self, contract: &mut TaskContract) -> GateResult<()> {
        let _guard = self.guard();
        let path = self.active_path(&contract.task_id);
        let stored = match read_record(&path) {
            Ok(stored) => stored,
            Err(GateError::Io(io)) if io.kind() == ErrorKind::NotFound => {
                return Err(GateError::not_found(format!("contract {}", contract.task_id)))
            }
            Err(e) => return Err(e),
        };
        if stored.version != contract.version {
            return Err(GateError::conflict(
                &contract.task_id,
                format!(
                    "stale write: stored version {} but caller read {}",
                    stored.version, contract.version
                ),
            ));
        }

        contract.version += 1;
        if let Err(e) = self.write_record(&path, contract) {
            contract.version -= 1;
            return Err(e);
        }
        debug!(task_id = %contract.task_id, version = contract.version, status = %contract.status, "Contract saved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub fn acquire_lock(&self, task_id: &str, actor: &str, ttl: Duration) -> GateResult<TaskContract> {
        self.acquire_lock_at(task_id, actor, ttl, Utc::now())
    }

    /// Take the task lock for `ttl`. An expired lock counts as absent; a live
    /// lock refuses everyone, its holder included.
    pub fn acquire_lock_at(
        &self,
        task_id: &str,
        actor: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> GateResult<TaskContract> {
        let ttl = chrono::Duration::from_std(ttl)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .ok_or_else(|| GateError::config("lock ttl must be positive"))?;

        let _guard = self.guard();
        let mut contract = self.load(task_id)?;

        if let Some(lock) = &contract.lock {
            if !lock.is_expired_at(now) {
                return Err(GateError::LockHeld {
                    task_id: task_id.to_string(),
                    holder: lock.holder.clone(),
                    expires_at: lock.expires_at,
                });
            }
            debug!(task_id, stale_holder = %lock.holder, "Reclaiming expired lock");
        }

        contract.lock = Some(TaskLock {
            holder: actor.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        });
        contract.version += 1;
        self.write_record(&self.active_path(task_id), &contract)?;

        debug!(task_id, actor, "Lock acquired");
        Ok(contract)
    }

    /// Drop the lock if `actor` holds it. Releasing an absent or expired lock
    /// is a no-op; another actor's live lock is refused.
    pub fn release_lock(&self, task_id: &str, actor: &str) -> GateResult<TaskContract> {
        self.release_lock_at(task_id, actor, Utc::now())
    }

    pub fn release_lock_at(
        &self,
        task_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> GateResult<TaskContract> {
        let _guard = self.guard();
        let mut contract = self.load(task_id)?;

        match &contract.lock {
            None => return Ok(contract),
            Some(lock) if lock.holder != actor => {
                if lock.is_expired_at(now) {
                    return Ok(contract);
                }
                return Err(GateError::LockHeld {
                    task_id: task_id.to_string(),
                    holder: lock.holder.clone(),
                    expires_at: lock.expires_at,
                });
            }
            Some(_) => {}
        }

        contract.lock = None;
        contract.version += 1;
        self.write_record(&self.active_path(task_id), &contract)?;
        debug!(task_id, actor, "Lock released");
        Ok(contract)
    }

    // ------------------------------------------------------------------
    // Archive
    // ------------------------------------------------------------------

    /// Freeze a terminal contract into the archive and drop its active record.
    pub fn archive(&self, contract: &TaskContract) -> GateResult<PathBuf> {
        if !contract.status.is_terminal() {
            return Err(GateError::conflict(
                &contract.task_id,
                format!("cannot archive non-terminal status {}", contract.status),
            ));
        }

        let _guard = self.guard();
        let active = self.active_path(&contract.task_id);
        match read_record(&active) {
            Ok(stored) if stored.version != contract.version => {
                return Err(GateError::conflict(
                    &contract.task_id,
                    format!(
                        "stale archive: stored version {} but caller read {}",
                        stored.version, contract.version
                    ),
                ));
            }
            Ok(_) => {}
            Err(GateError::Io(io)) if io.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut frozen = contract.clone();
        frozen.lock = None;
        let path = self.archive_path(&frozen.task_id, frozen.attempt);
        match write_immutable(&path, &serde_json::to_vec_pretty(&frozen)?) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Crash between archiving and removing the active record.
                let existing = read_record(&path)?;
                if existing.version != frozen.version {
                    return Err(GateError::already_exists(format!(
                        "archive {}",
                        path.display()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = fs::remove_file(&active) {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        info!(
            task_id = %frozen.task_id,
            attempt = frozen.attempt,
            status = %frozen.status,
            "Contract archived"
        );
        Ok(path)
    }

    pub fn load_archived(&self, task_id: &str, attempt: u32) -> GateResult<TaskContract> {
        let contract =
            read_record(&self.archive_path(task_id, attempt)).map_err(|e| match e {
                GateError::Io(io) if io.kind() == ErrorKind::NotFound => {
                    GateError::not_found(format!("archive {task_id} attempt {attempt}"))
                }
                other => other,
            })?;
        if contract.task_id != task_id {
            return Err(GateError::conflict(
                task_id,
                format!("archive entry belongs to task {}", contract.task_id),
            ));
        }
        Ok(contract)
    }

    /// Highest archived attempt of `task_id`.
    pub fn latest_archived(&self, task_id: &str) -> GateResult<Option<TaskContract>> {
        let prefix = format!("{}.attempt-", sanitize_task_id(task_id));
        let latest = json_files(&self.archive_dir)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let attempt = name.strip_prefix(&prefix)?.strip_suffix(".json")?;
                attempt.parse::<u32>().ok()
            })
            .max();
        latest
            .map(|attempt| self.load_archived(task_id, attempt))
            .transpose()
    }

    /// Every archived snapshot, ordered by task id then attempt.
    pub fn list_archived(&self) -> GateResult<Vec<TaskContract>> {
        let mut contracts: Vec<TaskContract> = json_files(&self.archive_dir)?
            .into_iter()
            .filter_map(|path| match read_record(&path) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable archive entry");
                    None
                }
            })
            .collect();
        contracts.sort_by(|a, b| (&a.task_id, a.attempt).cmp(&(&b.task_id, b.attempt)));
        Ok(contracts)
    }

    /// Start a new attempt from the latest archived consultation.
    ///
    /// Applies `human_reset` (attempt bump, breaker re-armed) and re-creates
    /// the active record. The returned entry belongs in the audit log.
    pub fn reset_from_archive(
        &self,
        task_id: &str,
        reason: &str,
    ) -> GateResult<(TaskContract, TransitionLogEntry)> {
        self.reset_from_archive_at(task_id, reason, Utc::now())
    }

    pub fn reset_from_archive_at(
        &self,
        task_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> GateResult<(TaskContract, TransitionLogEntry)> {
        if reason.trim().is_empty() {
            return Err(GateError::config("reset requires a reason"));
        }

        let _guard = self.guard();
        let active = self.active_path(task_id);
        if active.exists() {
            return Err(GateError::already_exists(format!(
                "active contract {task_id}"
            )));
        }

        let mut contract = self
            .latest_archived(task_id)?
            .ok_or_else(|| GateError::not_found(format!("archived contract {task_id}")))?;
        if contract.status != TaskStatus::ErikConsultation {
            return Err(GateError::conflict(
                task_id,
                format!(
                    "latest attempt {} ended in {}, not erik_consultation",
                    contract.attempt, contract.status
                ),
            ));
        }

        let entry = apply_event_with_reason(&mut contract, TaskEvent::HumanReset, Some(reason), now)?;
        contract.lock = None;
        contract.version = 1;
        self.write_record(&active, &contract)?;

        info!(
            task_id,
            attempt = contract.attempt,
            reason,
            "Contract reset for a new attempt"
        );
        Ok((contract, entry))
    }

    fn write_record(&self, path: &Path, contract: &TaskContract) -> GateResult<()> {
        atomic_write(path, &serde_json::to_vec_pretty(contract)?)?;
        Ok(())
    }
}

fn validate_limits(limits: &Limits) -> GateResult<()> {
    let t = &limits.timeouts;
    if [t.implementation, t.local_review, t.judge_review, t.rebuttal].contains(&0) {
        return Err(GateError::config("phase timeouts must be positive"));
    }
    if !(limits.cost_ceiling_usd.is_finite() && limits.cost_ceiling_usd >= 0.0) {
        return Err(GateError::config("cost_ceiling_usd must be a non-negative number"));
    }
    Ok(())
}

fn read_record(path: &Path) -> GateResult<TaskContract> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn json_files(dir: &Path) -> GateResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "json")
                && !p.to_string_lossy().ends_with(TMP_SUFFIX)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::contract::types::Complexity;

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: PathBuf,
        validator: SandboxValidator,
        store: ContractStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().canonicalize().unwrap();
        fs::create_dir_all(workspace.join("src")).unwrap();
        fs::write(workspace.join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(workspace.join("src/util.rs"), "pub fn b() {}\n").unwrap();
        let config = GateConfig::for_workspace(&workspace);
        let validator = SandboxValidator::new(&config).unwrap();
        let store = ContractStore::open(&config.state_dir).unwrap();
        Fixture {
            _dir: dir,
            workspace,
            validator,
            store,
        }
    }

    fn proposal(task_id: &str) -> TaskProposal {
        TaskProposal {
            task_id: task_id.into(),
            complexity: Complexity::Standard,
            source_paths: vec!["src/util.rs".into()],
            target_path: "src/lib.rs".into(),
            requirements: vec!["add b".into()],
            acceptance_criteria: vec![],
            limits: None,
            constraints: None,
        }
    }

    fn create(fx: &Fixture, task_id: &str) -> TaskContract {
        fx.store
            .create(&proposal(task_id), &fx.validator, &fx.workspace)
            .unwrap()
    }

    #[test]
    fn test_create_hashes_sources() {
        let fx = fixture();
        let c = create(&fx, "t1");
        assert_eq!(c.version, 1);
        assert_eq!(c.status, TaskStatus::PendingImplementer);
        assert_eq!(
            c.specification.source_artifacts[0].content_hash,
            content_hash(b"pub fn b() {}\n")
        );
        assert!(fx.store.exists("t1"));
        assert_eq!(fx.store.load("t1").unwrap(), c);
    }

    #[test]
    fn test_create_twice_fails() {
        let fx = fixture();
        create(&fx, "t1");
        let err = fx
            .store
            .create(&proposal("t1"), &fx.validator, &fx.workspace)
            .unwrap_err();
        assert!(matches!(err, GateError::AlreadyExists { .. }));
    }

    #[test]
    fn test_create_refuses_sensitive_source() {
        let fx = fixture();
        fs::write(fx.workspace.join("server.pem"), "x").unwrap();
        let mut p = proposal("t1");
        p.source_paths.push("server.pem".into());
        let err = fx
            .store
            .create(&p, &fx.validator, &fx.workspace)
            .unwrap_err();
        assert!(matches!(err, GateError::Validation { .. }));
        assert!(!fx.store.exists("t1"));
    }

    #[test]
    fn test_stale_save_conflicts() {
        let fx = fixture();
        create(&fx, "t1");
        let mut a = fx.store.load("t1").unwrap();
        let mut b = fx.store.load("t1").unwrap();

        a.status_reason = "first".into();
        fx.store.save(&mut a).unwrap();
        assert_eq!(a.version, 2);

        b.status_reason = "second".into();
        let err = fx.store.save(&mut b).unwrap_err();
        assert!(matches!(err, GateError::Conflict { .. }));
        assert_eq!(b.version, 1);
        assert_eq!(fx.store.load("t1").unwrap().status_reason, "first");
    }

    #[test]
    fn test_lock_not_reentrant_and_expires() {
        let fx = fixture();
        create(&fx, "t1");
        let now = Utc::now();
        let ttl = Duration::from_secs(60);

        fx.store.acquire_lock_at("t1", "a", ttl, now).unwrap();
        assert!(matches!(
            fx.store.acquire_lock_at("t1", "a", ttl, now),
            Err(GateError::LockHeld { .. })
        ));
        assert!(matches!(
            fx.store.release_lock_at("t1", "b", now),
            Err(GateError::LockHeld { .. })
        ));

        let later = now + chrono::Duration::seconds(60);
        let c = fx.store.acquire_lock_at("t1", "b", ttl, later).unwrap();
        assert!(c.is_locked_by("b", later));
    }

    #[test]
    fn test_zero_ttl_refused() {
        let fx = fixture();
        create(&fx, "t1");
        assert!(fx.store.acquire_lock("t1", "a", Duration::ZERO).is_err());
    }

    #[test]
    fn test_archive_is_immutable_and_removes_active() {
        let fx = fixture();
        let mut c = create(&fx, "t1");
        c.status = TaskStatus::ErikConsultation;
        fx.store.save(&mut c).unwrap();

        let path = fx.store.archive(&c).unwrap();
        assert!(path.ends_with("archive/t1.attempt-1.json"));
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
        assert!(!fx.store.exists("t1"));
        assert_eq!(fx.store.load_archived("t1", 1).unwrap().version, c.version);
        assert_eq!(fx.store.list_archived().unwrap().len(), 1);
    }

    #[test]
    fn test_load_archived_refuses_colliding_id() {
        let fx = fixture();
        let mut c = create(&fx, "t 1");
        c.status = TaskStatus::Merged;
        fx.store.save(&mut c).unwrap();
        fx.store.archive(&c).unwrap();

        assert_eq!(fx.store.load_archived("t 1", 1).unwrap().task_id, "t 1");
        // "t_1" sanitizes to the same archive file name.
        assert!(matches!(
            fx.store.load_archived("t_1", 1),
            Err(GateError::Conflict { .. })
        ));
        assert!(fx.store.latest_archived("t_1").is_err());
    }

    #[test]
    fn test_archive_refuses_non_terminal() {
        let fx = fixture();
        let c = create(&fx, "t1");
        assert!(matches!(
            fx.store.archive(&c),
            Err(GateError::Conflict { .. })
        ));
    }

    #[test]
    fn test_reset_from_archive_starts_next_attempt() {
        let fx = fixture();
        let mut c = create(&fx, "t1");
        c.status = TaskStatus::ErikConsultation;
        c.breaker.record_rebuttal();
        fx.store.save(&mut c).unwrap();
        fx.store.archive(&c).unwrap();

        let (reset, entry) = fx.store.reset_from_archive("t1", "clarified requirements").unwrap();
        assert_eq!(reset.attempt, 2);
        assert_eq!(reset.status, TaskStatus::PendingImplementer);
        assert_eq!(reset.breaker.rebuttal_count(), 0);
        assert_eq!(entry.event, TaskEvent::HumanReset);
        assert!(fx.store.exists("t1"));

        // A second archive of the same attempt is a fresh file.
        let mut again = fx.store.load("t1").unwrap();
        again.status = TaskStatus::Merged;
        fx.store.save(&mut again).unwrap();
        let path = fx.store.archive(&again).unwrap();
        assert!(path.ends_with("archive/t1.attempt-2.json"));
        assert_eq!(fx.store.latest_archived("t1").unwrap().unwrap().attempt, 2);
    }

    #[test]
    fn test_reset_requires_consultation() {
        let fx = fixture();
        let mut c = create(&fx, "t1");
        c.status = TaskStatus::Merged;
        fx.store.save(&mut c).unwrap();
        fx.store.archive(&c).unwrap();
        assert!(matches!(
            fx.store.reset_from_archive("t1", "again"),
            Err(GateError::Conflict { .. })
        ));
    }

    #[test]
    fn test_open_removes_interrupted_writes() {
        let fx = fixture();
        let tmp = fx.store.state_dir().join("contracts/.t1.json.abc.tmp");
        fs::write(&tmp, "{").unwrap();
        let reopened = ContractStore::open(fx.store.state_dir()).unwrap();
        assert!(!tmp.exists());
        assert!(reopened.list_active().unwrap().is_empty());
    }
}
