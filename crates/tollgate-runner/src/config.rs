//! Runner configuration: `tollgate.toml` plus `TOLLGATE_*` overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tollgate::GateConfig;
use tracing::debug;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tollgate.toml";

/// Worker endpoint and reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
    /// Reconnect attempts before a call gives up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8317".to_string(),
            connect_timeout_secs: 5,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 250,
        }
    }
}

/// Adaptive poll bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub growth_factor: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            max_interval_ms: 30_000,
            growth_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Disable for workspaces that are not git repositories.
    pub enabled: bool,
    pub main_branch: String,
    pub max_retries: u32,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            main_branch: "main".to_string(),
            max_retries: 3,
        }
    }
}

/// Top-level runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub gate: GateConfig,
    pub worker: WorkerConfig,
    pub poll: PollConfig,
    pub git: GitConfig,
    /// Lock holder name for this orchestrator.
    pub actor: String,
    /// Added to the phase timeout when sizing a task lock.
    pub lock_grace_secs: u64,
    /// Judges consulted per judge review; all must pass.
    pub judge_panel_size: usize,
    /// Concurrent worker calls in a panel.
    pub max_parallel_workers: usize,
    /// `timeout_retry` attempts per phase before the task halts.
    pub max_timeout_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            worker: WorkerConfig::default(),
            poll: PollConfig::default(),
            git: GitConfig::default(),
            actor: "tollgate-orchestrator".to_string(),
            lock_grace_secs: 60,
            judge_panel_size: 1,
            max_parallel_workers: 4,
            max_timeout_retries: 2,
        }
    }
}

impl RunnerConfig {
    /// Load from `path`, else `$TOLLGATE_CONFIG`, else `./tollgate.toml` if
    /// present, else defaults. Environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("TOLLGATE_CONFIG").map(PathBuf::from));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        debug!(path = %path.display(), "Loaded runner config");
        Ok(config)
    }

    /// Apply `TOLLGATE_*` overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TOLLGATE_WORKSPACE") {
            self.gate.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOLLGATE_SANDBOX") {
            self.gate.sandbox_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOLLGATE_STATE_DIR") {
            self.gate.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOLLGATE_WORKER_URL") {
            self.worker.url = v;
        }
        if let Some(v) = lookup("TOLLGATE_ACTOR") {
            self.actor = v;
        }
    }

    /// Anchor relative sandbox and state paths at the workspace root.
    pub fn resolve_paths(&mut self) {
        let root = self.gate.workspace_root.clone();
        for dir in [&mut self.gate.sandbox_root, &mut self.gate.state_dir] {
            if dir.is_relative() {
                *dir = root.join(&*dir);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.gate
            .validate()
            .map_err(|e| anyhow::anyhow!(e.with_suggestion()))?;
        if self.actor.trim().is_empty() {
            bail!("actor must not be empty");
        }
        if self.judge_panel_size == 0 {
            bail!("judge_panel_size must be at least 1");
        }
        if self.max_parallel_workers == 0 {
            bail!("max_parallel_workers must be at least 1");
        }
        if self.poll.min_interval_ms == 0 || self.poll.min_interval_ms > self.poll.max_interval_ms {
            bail!("poll interval bounds must satisfy 0 < min <= max");
        }
        if self.poll.growth_factor.is_nan() || self.poll.growth_factor < 1.0 {
            bail!("poll growth_factor must be >= 1.0");
        }
        if !self.worker.url.starts_with("http://") && !self.worker.url.starts_with("https://") {
            bail!("worker url must be http(s): {}", self.worker.url);
        }
        Ok(())
    }

    pub fn lock_grace(&self) -> Duration {
        Duration::from_secs(self.lock_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let mut config = RunnerConfig::default();
        config.resolve_paths();
        config.validate().unwrap();
        assert_eq!(config.judge_panel_size, 1);
    }

    #[test]
    fn test_toml_sections() {
        let config: RunnerConfig = toml::from_str(
            r#"
            actor = "orch-7"
            judge_panel_size = 3

            [gate]
            workspace_root = "/srv/app"
            max_delete_ratio = 0.4

            [worker]
            url = "http://workers:9000"

            [git]
            main_branch = "trunk"
            "#,
        )
        .unwrap();
        assert_eq!(config.actor, "orch-7");
        assert_eq!(config.judge_panel_size, 3);
        assert_eq!(config.gate.max_delete_ratio, 0.4);
        assert_eq!(config.worker.url, "http://workers:9000");
        assert_eq!(config.worker.max_reconnect_attempts, 5);
        assert_eq!(config.git.main_branch, "trunk");
        assert!(config.git.enabled);
    }

    #[test]
    fn test_env_overrides_and_path_resolution() {
        let env: HashMap<&str, &str> = [
            ("TOLLGATE_WORKSPACE", "/repo"),
            ("TOLLGATE_WORKER_URL", "https://pool.internal"),
            ("TOLLGATE_ACTOR", "night-shift"),
        ]
        .into_iter()
        .collect();

        let mut config = RunnerConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        config.resolve_paths();

        assert_eq!(config.gate.workspace_root, PathBuf::from("/repo"));
        assert_eq!(
            config.gate.sandbox_root,
            PathBuf::from("/repo/.tollgate/sandbox")
        );
        assert_eq!(config.gate.state_dir, PathBuf::from("/repo/.tollgate/state"));
        assert_eq!(config.worker.url, "https://pool.internal");
        assert_eq!(config.actor, "night-shift");
    }

    #[test]
    fn test_validate_rejects_empty_panel() {
        let config = RunnerConfig {
            judge_panel_size: 0,
            ..RunnerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.toml");
        std::fs::write(&path, "max_timeout_retries = 5\n").unwrap();
        let config = RunnerConfig::from_file(&path).unwrap();
        assert_eq!(config.max_timeout_retries, 5);
        assert!(RunnerConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
