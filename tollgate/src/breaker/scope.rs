//! Gitignore-style path scope matching for task constraints.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::contract::types::Constraints;
use crate::error::{GateError, GateResult};

/// Compiled `allowed_paths` / `forbidden_paths` of a task.
pub struct PathScope {
    allowed: Option<Gitignore>,
    forbidden: Option<Gitignore>,
}

impl PathScope {
    pub fn from_constraints(constraints: &Constraints) -> GateResult<Self> {
        Ok(Self {
            allowed: build(&constraints.allowed_paths)?,
            forbidden: build(&constraints.forbidden_paths)?,
        })
    }

    /// Reason `path` (workspace-relative) falls out of scope, if it does.
    pub fn violation(&self, path: &str) -> Option<String> {
        let rel = path.trim_start_matches("./");
        let rel_path = Path::new(rel);
        if rel_path.has_root() {
            return Some(format!("{path} is not workspace-relative"));
        }

        if let Some(forbidden) = &self.forbidden {
            if forbidden
                .matched_path_or_any_parents(rel_path, false)
                .is_ignore()
            {
                return Some(format!("{path} matches forbidden_paths"));
            }
        }
        if let Some(allowed) = &self.allowed {
            if !allowed
                .matched_path_or_any_parents(rel_path, false)
                .is_ignore()
            {
                return Some(format!("{path} lies outside allowed_paths"));
            }
        }
        None
    }
}

fn build(patterns: &[String]) -> GateResult<Option<Gitignore>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GitignoreBuilder::new("");
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| GateError::config(format!("bad path pattern `{pattern}`: {e}")))?;
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| GateError::config(format!("bad path patterns: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(allowed: &[&str], forbidden: &[&str]) -> PathScope {
        PathScope::from_constraints(&Constraints {
            allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
            forbidden_paths: forbidden.iter().map(|s| s.to_string()).collect(),
            ..Constraints::default()
        })
        .unwrap()
    }

    #[test]
    fn test_empty_scope_allows_everything_relative() {
        let s = scope(&[], &[]);
        assert!(s.violation("src/lib.rs").is_none());
        assert!(s.violation("/etc/passwd").is_some());
    }

    #[test]
    fn test_forbidden_directory_pattern() {
        let s = scope(&[], &["migrations/", "*.lock"]);
        assert!(s.violation("migrations/001_init.sql").is_some());
        assert!(s.violation("Cargo.lock").is_some());
        assert!(s.violation("src/migrate.rs").is_none());
    }

    #[test]
    fn test_allowed_paths_restrict() {
        let s = scope(&["src/**/*.rs", "docs/"], &["src/generated/"]);
        assert!(s.violation("src/a/b.rs").is_none());
        assert!(s.violation("./docs/guide.md").is_none());
        assert!(s.violation("build.rs").unwrap().contains("outside"));
        assert!(s.violation("src/generated/x.rs").unwrap().contains("forbidden"));
    }
}
