//! Sandbox path validation
//!
//! The only gate between "worker-writable" and "everything else". Writes are
//! allowed strictly inside the sandbox root; reads strictly inside a
//! workspace root and never from credential-like files. Every ambiguity
//! (dangling resolution, permission error, symlink cycle) blocks.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};

/// Outcome of a path check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCheck {
    /// Path is acceptable; carries the fully resolved form.
    Allowed(PathBuf),
    /// Path is refused.
    Blocked(String),
}

impl PathCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Convert into a result, attributing a block to `requested`.
    pub fn into_result(self, requested: impl Into<PathBuf>) -> GateResult<PathBuf> {
        match self {
            Self::Allowed(resolved) => Ok(resolved),
            Self::Blocked(reason) => Err(GateError::validation(requested, reason)),
        }
    }
}

/// Validates every path a worker or the draft gate touches.
#[derive(Debug, Clone)]
pub struct SandboxValidator {
    sandbox_root: PathBuf,
    protected_roots: Vec<PathBuf>,
    allowed_extensions: Vec<String>,
    sensitive: Vec<Regex>,
    max_symlink_hops: usize,
}

impl SandboxValidator {
    /// Build a validator from config. Creates the sandbox and state
    /// directories if missing so both can be canonicalized.
    pub fn new(config: &GateConfig) -> GateResult<Self> {
        fs::create_dir_all(&config.sandbox_root)?;
        fs::create_dir_all(&config.state_dir)?;
        let sandbox_root = config.sandbox_root.canonicalize()?;
        let state_root = config.state_dir.canonicalize()?;

        let sensitive = config
            .sensitive_patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<GateResult<Vec<_>>>()?;

        Ok(Self {
            protected_roots: vec![sandbox_root.clone(), state_root],
            sandbox_root,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            sensitive,
            max_symlink_hops: config.max_symlink_hops,
        })
    }

    /// Canonical sandbox root.
    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// Check a path a worker wants to write. Relative paths are taken
    /// relative to the sandbox root.
    pub fn validate_write(&self, path: &Path) -> PathCheck {
        if let Some(reason) = traversal_segment(path) {
            return self.block(path, reason);
        }

        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sandbox_root.join(path)
        };

        let resolved = match self.resolve(&candidate) {
            Ok(r) => r,
            Err(reason) => return self.block(path, reason),
        };

        if !is_strict_descendant(&resolved, &self.sandbox_root) {
            return self.block(path, "resolves outside the sandbox root".to_string());
        }

        let ext_ok = resolved
            .extension()
            .map(|e| {
                let e = e.to_string_lossy().to_ascii_lowercase();
                self.allowed_extensions.iter().any(|a| *a == e)
            })
            .unwrap_or(false);
        if !ext_ok {
            return self.block(
                path,
                format!(
                    "extension not in allowlist [{}]",
                    self.allowed_extensions.join(", ")
                ),
            );
        }

        match fs::symlink_metadata(&resolved) {
            Ok(meta) if !meta.is_file() => {
                return self.block(path, "target exists and is not a regular file".to_string())
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return self.block(path, format!("cannot stat target: {e}")),
        }

        PathCheck::Allowed(resolved)
    }

    /// Check a path the gate wants to read (or overwrite on apply) inside
    /// `workspace_root`. Relative paths are taken relative to it.
    pub fn validate_read(&self, path: &Path, workspace_root: &Path) -> PathCheck {
        if let Some(reason) = traversal_segment(path) {
            return self.block(path, reason);
        }
        if self.is_sensitive(path) {
            return self.block(path, "matches a sensitive file pattern".to_string());
        }

        let root = match workspace_root.canonicalize() {
            Ok(r) => r,
            Err(e) => return self.block(path, format!("cannot resolve workspace root: {e}")),
        };

        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };

        let resolved = match self.resolve(&candidate) {
            Ok(r) => r,
            Err(reason) => return self.block(path, reason),
        };

        if !is_strict_descendant(&resolved, &root) {
            return self.block(path, "resolves outside the workspace root".to_string());
        }
        if self
            .protected_roots
            .iter()
            .any(|p| resolved.starts_with(p))
        {
            return self.block(path, "resolves into a tollgate control directory".to_string());
        }
        if self.is_sensitive(&resolved) {
            return self.block(path, "resolves to a sensitive file".to_string());
        }

        match fs::metadata(&resolved) {
            Ok(meta) if meta.is_file() => PathCheck::Allowed(resolved),
            Ok(_) => self.block(path, "not a regular file".to_string()),
            Err(e) => self.block(path, format!("cannot stat: {e}")),
        }
    }

    /// Resolve a sandbox-relative artifact path for reading.
    pub fn resolve_in_sandbox(&self, relative: &Path) -> GateResult<PathBuf> {
        if relative.is_absolute() {
            return Err(GateError::validation(
                relative,
                "sandbox artifact paths must be relative",
            ));
        }
        if let Some(reason) = traversal_segment(relative) {
            return Err(GateError::validation(relative, reason));
        }

        let resolved = self
            .resolve(&self.sandbox_root.join(relative))
            .map_err(|reason| GateError::validation(relative, reason))?;
        if !is_strict_descendant(&resolved, &self.sandbox_root) {
            return Err(GateError::validation(
                relative,
                "resolves outside the sandbox root",
            ));
        }
        Ok(resolved)
    }

    /// Whether the file name looks like a credential store.
    pub fn is_sensitive(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        self.sensitive.iter().any(|re| re.is_match(&name))
    }

    fn block(&self, path: &Path, reason: String) -> PathCheck {
        warn!(path = %path.display(), reason = %reason, "Sandbox blocked path");
        PathCheck::Blocked(reason)
    }

    /// Resolve symlinks one component at a time.
    ///
    /// Components past the first missing entry are appended literally since
    /// nothing below a missing directory can be a link.
    fn resolve(&self, path: &Path) -> Result<PathBuf, String> {
        let mut pending: VecDeque<OsString> = VecDeque::new();
        let mut resolved = PathBuf::new();

        for comp in path.components() {
            match comp {
                Component::Prefix(p) => resolved.push(p.as_os_str()),
                Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
                other => pending.push_back(other.as_os_str().to_os_string()),
            }
        }
        if !resolved.has_root() {
            return Err("path is not absolute after joining its root".to_string());
        }

        let mut hops = 0usize;
        let mut missing = false;

        while let Some(part) = pending.pop_front() {
            if part == "." {
                continue;
            }
            if part == ".." {
                if !resolved.pop() {
                    return Err("traversal above filesystem root".to_string());
                }
                continue;
            }

            let next = resolved.join(&part);
            if missing {
                resolved = next;
                continue;
            }

            match fs::symlink_metadata(&next) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    hops += 1;
                    if hops > self.max_symlink_hops {
                        return Err(format!(
                            "symlink chain exceeds {} hops",
                            self.max_symlink_hops
                        ));
                    }
                    let target =
                        fs::read_link(&next).map_err(|e| format!("unreadable symlink: {e}"))?;
                    debug!(link = %next.display(), target = %target.display(), "Following symlink");

                    let mut front: Vec<OsString> = Vec::new();
                    for comp in target.components() {
                        match comp {
                            Component::Prefix(_) | Component::RootDir => {
                                resolved = PathBuf::from(comp.as_os_str());
                                front.clear();
                            }
                            other => front.push(other.as_os_str().to_os_string()),
                        }
                    }
                    for item in front.into_iter().rev() {
                        pending.push_front(item);
                    }
                }
                Ok(_) => resolved = next,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    missing = true;
                    resolved = next;
                }
                Err(e) => return Err(format!("cannot inspect {}: {e}", next.display())),
            }
        }

        Ok(resolved)
    }
}

/// Reject `..` and `.` segments in the raw path text.
fn traversal_segment(path: &Path) -> Option<String> {
    let text = path.to_string_lossy();
    text.split(['/', '\\'])
        .find(|seg| *seg == ".." || *seg == ".")
        .map(|seg| format!("contains traversal segment `{seg}`"))
}

fn is_strict_descendant(path: &Path, root: &Path) -> bool {
    path != root && path.starts_with(root)
}

/// Compile a `*`-wildcard file name pattern, case-insensitive.
fn glob_to_regex(pattern: &str) -> GateResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i)^{body}$"))
        .map_err(|e| GateError::config(format!("bad sensitive pattern `{pattern}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        validator: SandboxValidator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let workspace = root.join("ws");
        fs::create_dir_all(workspace.join("src")).unwrap();
        fs::write(workspace.join("src/lib.rs"), "fn main() {}\n").unwrap();
        fs::write(workspace.join(".env"), "TOKEN=x\n").unwrap();

        let config = GateConfig {
            workspace_root: workspace.clone(),
            sandbox_root: root.join("sandbox"),
            state_dir: root.join("state"),
            ..GateConfig::default()
        };
        let validator = SandboxValidator::new(&config).unwrap();
        Fixture {
            _dir: dir,
            root,
            validator,
        }
    }

    #[test]
    fn test_write_inside_sandbox_allowed() {
        let fx = fixture();
        let check = fx.validator.validate_write(Path::new("t1__lib.rs.draft"));
        assert_eq!(
            check,
            PathCheck::Allowed(fx.root.join("sandbox/t1__lib.rs.draft"))
        );
    }

    #[test]
    fn test_write_traversal_blocked() {
        let fx = fixture();
        assert!(!fx
            .validator
            .validate_write(Path::new("../ws/src/lib.rs.draft"))
            .is_allowed());
        assert!(!fx
            .validator
            .validate_write(Path::new("./a.draft"))
            .is_allowed());
        let abs = fx.root.join("sandbox/sub/../a.draft");
        assert!(!fx.validator.validate_write(&abs).is_allowed());
    }

    #[test]
    fn test_write_bad_extension_blocked() {
        let fx = fixture();
        let check = fx.validator.validate_write(Path::new("payload.sh"));
        assert!(matches!(check, PathCheck::Blocked(r) if r.contains("allowlist")));
    }

    #[test]
    fn test_write_root_itself_blocked() {
        let fx = fixture();
        let root = fx.validator.sandbox_root().to_path_buf();
        assert!(!fx.validator.validate_write(&root).is_allowed());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_through_escaping_symlink_blocked() {
        let fx = fixture();
        std::os::unix::fs::symlink(fx.root.join("ws"), fx.root.join("sandbox/escape")).unwrap();
        let check = fx.validator.validate_write(Path::new("escape/x.draft"));
        assert!(matches!(check, PathCheck::Blocked(r) if r.contains("outside")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_fails_closed() {
        let fx = fixture();
        let a = fx.root.join("sandbox/a");
        let b = fx.root.join("sandbox/b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();
        let check = fx.validator.validate_write(Path::new("a/x.draft"));
        assert!(matches!(check, PathCheck::Blocked(r) if r.contains("hops")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_sandbox_resolves() {
        let fx = fixture();
        fs::create_dir_all(fx.root.join("sandbox/real")).unwrap();
        std::os::unix::fs::symlink("real", fx.root.join("sandbox/alias")).unwrap();
        let check = fx.validator.validate_write(Path::new("alias/x.json"));
        assert_eq!(check, PathCheck::Allowed(fx.root.join("sandbox/real/x.json")));
    }

    #[test]
    fn test_read_workspace_file_allowed() {
        let fx = fixture();
        let ws = fx.root.join("ws");
        let check = fx.validator.validate_read(Path::new("src/lib.rs"), &ws);
        assert_eq!(check, PathCheck::Allowed(ws.join("src/lib.rs")));
    }

    #[test]
    fn test_read_sensitive_blocked() {
        let fx = fixture();
        let ws = fx.root.join("ws");
        let check = fx.validator.validate_read(Path::new(".env"), &ws);
        assert!(matches!(check, PathCheck::Blocked(r) if r.contains("sensitive")));
    }

    #[test]
    fn test_read_missing_or_outside_blocked() {
        let fx = fixture();
        let ws = fx.root.join("ws");
        assert!(!fx
            .validator
            .validate_read(Path::new("src/missing.rs"), &ws)
            .is_allowed());
        assert!(!fx
            .validator
            .validate_read(Path::new("../state/x"), &ws)
            .is_allowed());
        assert!(!fx
            .validator
            .validate_read(Path::new("src"), &ws)
            .is_allowed());
    }

    #[test]
    fn test_is_sensitive_patterns() {
        let fx = fixture();
        let v = &fx.validator;
        for name in [
            ".env",
            ".env.production",
            "server.pem",
            "tls.KEY",
            "id_rsa.pub",
            "id_ed25519",
            "aws_credentials.json",
            "client_secret.txt",
            ".npmrc",
            ".netrc",
            "store.p12",
            "release.keystore",
        ] {
            assert!(v.is_sensitive(Path::new(name)), "{name} should be sensitive");
        }
        for name in ["main.rs", "environment.md", "keyboard.rs", "README"] {
            assert!(!v.is_sensitive(Path::new(name)), "{name} should be allowed");
        }
    }

    #[test]
    fn test_resolve_in_sandbox() {
        let fx = fixture();
        let ok = fx
            .validator
            .resolve_in_sandbox(Path::new("t1__a.rs.submission.json"))
            .unwrap();
        assert!(ok.starts_with(fx.validator.sandbox_root()));
        assert!(fx
            .validator
            .resolve_in_sandbox(Path::new("../state/contracts/t1.json"))
            .is_err());
        assert!(fx.validator.resolve_in_sandbox(Path::new("/etc/passwd")).is_err());
    }
}
