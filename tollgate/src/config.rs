//! Gate configuration
//!
//! One explicit object, built once at startup and passed by reference to every
//! component. There is no ambient global configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Default deletion ratio at which drafts escalate and the breaker trips.
pub const DEFAULT_MAX_DELETE_RATIO: f64 = 0.5;

/// Default symlink hop budget for path resolution.
pub const DEFAULT_MAX_SYMLINK_HOPS: usize = 40;

/// Configuration shared by the sandbox, store, breakers and draft gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Production tree that accepted drafts are applied to.
    pub workspace_root: PathBuf,
    /// The only directory workers may write to.
    pub sandbox_root: PathBuf,
    /// Contracts, archive, halt reports and the transition log.
    pub state_dir: PathBuf,
    /// Drafts at or above this deletion ratio escalate; the breaker trips above it.
    pub max_delete_ratio: f64,
    /// Per-draft scope limit on added + deleted lines.
    pub max_draft_lines: usize,
    /// Symlink hops allowed while resolving a path.
    pub max_symlink_hops: usize,
    /// Extensions allowed for files written into the sandbox.
    pub allowed_extensions: Vec<String>,
    /// Credential-like file name patterns (`*` wildcards, case-insensitive).
    pub sensitive_patterns: Vec<String>,
    /// Additional secret regexes applied to added diff lines.
    pub extra_secret_patterns: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            sandbox_root: PathBuf::from(".tollgate/sandbox"),
            state_dir: PathBuf::from(".tollgate/state"),
            max_delete_ratio: DEFAULT_MAX_DELETE_RATIO,
            max_draft_lines: 400,
            max_symlink_hops: DEFAULT_MAX_SYMLINK_HOPS,
            allowed_extensions: vec!["draft".into(), "json".into()],
            sensitive_patterns: default_sensitive_patterns(),
            extra_secret_patterns: Vec::new(),
        }
    }
}

fn default_sensitive_patterns() -> Vec<String> {
    [
        ".env",
        ".env.*",
        "*.pem",
        "*.key",
        "id_rsa*",
        "id_ed25519*",
        "id_ecdsa*",
        "*credentials*",
        "*secret*",
        ".npmrc",
        ".pypirc",
        ".netrc",
        "*.p12",
        "*.pfx",
        "*.keystore",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl GateConfig {
    /// Build a config rooted at `workspace_root` with the sandbox and state
    /// directories under `<workspace_root>/.tollgate`.
    pub fn for_workspace(workspace_root: impl AsRef<Path>) -> Self {
        let root = workspace_root.as_ref().to_path_buf();
        Self {
            sandbox_root: root.join(".tollgate").join("sandbox"),
            state_dir: root.join(".tollgate").join("state"),
            workspace_root: root,
            ..Self::default()
        }
    }

    /// Parse from TOML text.
    pub fn from_toml_str(content: &str) -> GateResult<Self> {
        toml::from_str(content).map_err(|e| GateError::config(e.to_string()))
    }

    /// Check internal consistency. Called once at startup.
    pub fn validate(&self) -> GateResult<()> {
        if !(self.max_delete_ratio > 0.0 && self.max_delete_ratio <= 1.0) {
            return Err(GateError::config(format!(
                "max_delete_ratio must be in (0, 1], got {}",
                self.max_delete_ratio
            )));
        }
        if self.max_draft_lines == 0 {
            return Err(GateError::config("max_draft_lines must be positive"));
        }
        if self.max_symlink_hops == 0 {
            return Err(GateError::config("max_symlink_hops must be positive"));
        }
        if self.allowed_extensions.is_empty() {
            return Err(GateError::config("allowed_extensions must not be empty"));
        }
        if self.sandbox_root == self.workspace_root {
            return Err(GateError::config(
                "sandbox_root must differ from workspace_root",
            ));
        }
        if self.workspace_root.starts_with(&self.sandbox_root) {
            return Err(GateError::config(
                "workspace_root must not live inside sandbox_root",
            ));
        }
        for pattern in &self.extra_secret_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                GateError::config(format!("invalid secret pattern `{pattern}`: {e}"))
            })?;
        }
        Ok(())
    }

    /// Directory holding active contracts.
    pub fn contracts_dir(&self) -> PathBuf {
        self.state_dir.join("contracts")
    }

    /// Append-only transition log.
    pub fn transition_log_path(&self) -> PathBuf {
        self.state_dir.join("transitions.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_delete_ratio, 0.5);
        assert_eq!(config.max_symlink_hops, 40);
    }

    #[test]
    fn test_for_workspace_nests_control_dirs() {
        let config = GateConfig::for_workspace("/repo");
        assert_eq!(config.sandbox_root, PathBuf::from("/repo/.tollgate/sandbox"));
        assert_eq!(config.state_dir, PathBuf::from("/repo/.tollgate/state"));
        assert_eq!(
            config.transition_log_path(),
            PathBuf::from("/repo/.tollgate/state/transitions.jsonl")
        );
    }

    #[test]
    fn test_from_toml_partial_uses_defaults() {
        let config = GateConfig::from_toml_str(
            r#"
            workspace_root = "/srv/app"
            sandbox_root = "/srv/sandbox"
            max_delete_ratio = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("/srv/app"));
        assert_eq!(config.max_delete_ratio, 0.3);
        assert_eq!(config.max_draft_lines, 400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let config = GateConfig {
            max_delete_ratio: 1.5,
            ..GateConfig::default()
        };
        assert!(matches!(config.validate(), Err(GateError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_workspace_inside_sandbox() {
        let config = GateConfig {
            workspace_root: PathBuf::from("/sb/ws"),
            sandbox_root: PathBuf::from("/sb"),
            ..GateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_secret_regex() {
        let config = GateConfig {
            extra_secret_patterns: vec!["(unclosed".into()],
            ..GateConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
