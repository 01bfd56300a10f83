//! Version control for task branches, checkpoints and merges.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tollgate::fsutil::sanitize_task_id;
use tracing::{debug, info, warn};

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Prefix on every commit the runner makes.
const COMMIT_PREFIX: &str = "[tollgate]";

/// Control directory kept out of every checkpoint.
const CONTROL_DIR: &str = ".tollgate/";

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0} is not a git repository")]
    NotARepository(PathBuf),
}

impl VcsError {
    /// Lock contention from a concurrent git process.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Command { stderr, .. } => {
                stderr.contains("index.lock")
                    || stderr.contains("could not lock")
                    || stderr.contains("Another git process")
            }
            _ => false,
        }
    }
}

/// Branch, checkpoint and merge operations the orchestrator needs.
pub trait VersionControl: Send + Sync {
    /// Create the task branch if missing and switch to it. Returns the
    /// branch name.
    fn create_branch(&self, task_id: &str) -> Result<String, VcsError>;

    /// Commit everything outstanding. `None` when there was nothing to commit.
    fn checkpoint_commit(&self, message: &str) -> Result<Option<String>, VcsError>;

    /// Merge the task branch into the main branch.
    fn merge_to_main(&self, task_id: &str) -> Result<(), VcsError>;
}

/// Branch name for a task.
pub fn task_branch(task_id: &str) -> String {
    format!("tollgate/{}", sanitize_task_id(task_id))
}

/// Git CLI backend.
pub struct GitVcs {
    working_dir: PathBuf,
    main_branch: String,
    max_retries: u32,
}

impl GitVcs {
    /// Open the repository at `working_dir` and keep the control directory
    /// out of its commits.
    pub fn new(
        working_dir: impl AsRef<Path>,
        main_branch: impl Into<String>,
    ) -> Result<Self, VcsError> {
        let vcs = Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            main_branch: main_branch.into(),
            max_retries: 3,
        };
        let git_dir = vcs
            .run_git(&["rev-parse", "--git-dir"])
            .map_err(|_| VcsError::NotARepository(vcs.working_dir.clone()))?;
        vcs.exclude_control_dir(&vcs.working_dir.join(git_dir))?;
        Ok(vcs)
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn exclude_control_dir(&self, git_dir: &Path) -> Result<(), VcsError> {
        let exclude = git_dir.join("info").join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == CONTROL_DIR) {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{CONTROL_DIR}")?;
        debug!(path = %exclude.display(), "Excluded control directory from git");
        Ok(())
    }

    fn run_git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Command {
                command: args.join(" "),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git, retrying lock contention with exponential backoff:
    /// 100ms, 200ms, 400ms, etc.
    fn run_git_with_retry(&self, args: &[&str]) -> Result<String, VcsError> {
        let mut attempt = 0;
        loop {
            match self.run_git(args) {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    warn!(command = %args.join(" "), attempt, delay_ms = delay, "Retrying git");
                    std::thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn branch_exists(&self, branch: &str) -> bool {
        self.run_git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .is_ok()
    }
}

impl VersionControl for GitVcs {
    fn create_branch(&self, task_id: &str) -> Result<String, VcsError> {
        let branch = task_branch(task_id);
        if self.branch_exists(&branch) {
            self.run_git_with_retry(&["checkout", &branch])?;
        } else {
            self.run_git_with_retry(&["checkout", "-b", &branch, &self.main_branch])?;
            info!(task_id, branch = %branch, "Created task branch");
        }
        Ok(branch)
    }

    fn checkpoint_commit(&self, message: &str) -> Result<Option<String>, VcsError> {
        self.run_git_with_retry(&["add", "-A"])?;
        if self.run_git(&["status", "--porcelain"])?.is_empty() {
            return Ok(None);
        }
        let full = format!("{COMMIT_PREFIX} {message}");
        self.run_git_with_retry(&["commit", "-m", &full])?;
        let hash = self.run_git(&["rev-parse", "--short", "HEAD"])?;
        debug!(hash = %hash, message, "Checkpoint commit");
        Ok(Some(hash))
    }

    fn merge_to_main(&self, task_id: &str) -> Result<(), VcsError> {
        let branch = task_branch(task_id);
        self.run_git_with_retry(&["checkout", &self.main_branch])?;
        let message = format!("{COMMIT_PREFIX} merge {branch}");
        if let Err(e) = self.run_git(&["merge", "--no-ff", "-m", &message, &branch]) {
            if let Err(abort) = self.run_git(&["merge", "--abort"]) {
                warn!(error = %abort, "git merge --abort failed");
            }
            return Err(e);
        }
        info!(task_id, branch = %branch, main = %self.main_branch, "Merged task branch");
        Ok(())
    }
}

/// Stand-in for workspaces without git. Every operation succeeds.
pub struct NoopVcs;

impl VersionControl for NoopVcs {
    fn create_branch(&self, task_id: &str) -> Result<String, VcsError> {
        Ok(task_branch(task_id))
    }

    fn checkpoint_commit(&self, _message: &str) -> Result<Option<String>, VcsError> {
        Ok(None)
    }

    fn merge_to_main(&self, _task_id: &str) -> Result<(), VcsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(
            output.status.success(),
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        git(p, &["init", "-q", "-b", "main"]);
        git(p, &["config", "user.name", "Tollgate Test"]);
        git(p, &["config", "user.email", "test@tollgate.local"]);
        fs::write(p.join("lib.rs"), "pub fn a() {}\n").unwrap();
        git(p, &["add", "-A"]);
        git(p, &["commit", "-q", "-m", "init"]);
        dir
    }

    #[test]
    fn test_not_a_repository() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GitVcs::new(dir.path(), "main"),
            Err(VcsError::NotARepository(_))
        ));
    }

    #[test]
    fn test_branch_checkpoint_merge() {
        if !git_available() {
            return;
        }
        let dir = repo();
        let p = dir.path();
        let vcs = GitVcs::new(p, "main").unwrap();

        let branch = vcs.create_branch("task 7").unwrap();
        assert_eq!(branch, "tollgate/task_7");
        assert_eq!(vcs.create_branch("task 7").unwrap(), branch);
        assert_eq!(git(p, &["rev-parse", "--abbrev-ref", "HEAD"]), branch);

        assert_eq!(vcs.checkpoint_commit("nothing").unwrap(), None);

        fs::create_dir_all(p.join(".tollgate/state")).unwrap();
        fs::write(p.join(".tollgate/state/x.json"), "{}").unwrap();
        assert_eq!(vcs.checkpoint_commit("control only").unwrap(), None);

        fs::write(p.join("lib.rs"), "pub fn a() -> u8 { 1 }\n").unwrap();
        let hash = vcs.checkpoint_commit("task 7: implementation").unwrap();
        assert!(hash.is_some());
        assert!(git(p, &["log", "-1", "--format=%s"]).starts_with("[tollgate] task 7"));

        vcs.merge_to_main("task 7").unwrap();
        assert_eq!(git(p, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
        assert_eq!(
            fs::read_to_string(p.join("lib.rs")).unwrap(),
            "pub fn a() -> u8 { 1 }\n"
        );
    }

    #[test]
    fn test_exclude_written_once() {
        if !git_available() {
            return;
        }
        let dir = repo();
        GitVcs::new(dir.path(), "main").unwrap();
        GitVcs::new(dir.path(), "main").unwrap();
        let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.lines().filter(|l| *l == CONTROL_DIR).count(), 1);
    }

    #[test]
    fn test_retryable_classification() {
        let locked = VcsError::Command {
            command: "commit".into(),
            stderr: "fatal: Unable to create '.git/index.lock': File exists.".into(),
        };
        assert!(locked.is_retryable());
        let conflict = VcsError::Command {
            command: "merge".into(),
            stderr: "CONFLICT (content): Merge conflict in lib.rs".into(),
        };
        assert!(!conflict.is_retryable());
    }
}
