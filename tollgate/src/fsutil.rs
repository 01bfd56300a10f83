//! Durable file helpers shared by the contract store and the draft gate.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Suffix carried by in-flight atomic writes.
pub const TMP_SUFFIX: &str = ".tmp";

/// Longest sanitized task id used in file and branch names.
const MAX_SANITIZED_LEN: usize = 64;

/// BLAKE3 hex digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Reduce a task id to `[A-Za-z0-9_-]`, at most 64 characters.
///
/// Never returns an empty string.
pub fn sanitize_task_id(task_id: &str) -> String {
    let cleaned: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SANITIZED_LEN)
        .collect();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_name = format!(".{name}.{}{TMP_SUFFIX}", uuid::Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Write `bytes` to `path` atomically.
///
/// Strategy:
/// 1. Write to a temp file in the same directory
/// 2. fsync the temp file
/// 3. Rename over the target (atomic on POSIX filesystems)
/// 4. fsync the directory, best effort
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        // Replacing a file keeps its mode.
        if let Ok(existing) = fs::metadata(path) {
            fs::set_permissions(&tmp, existing.permissions())?;
        }
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    debug!(path = %path.display(), bytes = bytes.len(), "Atomic write completed");
    Ok(())
}

/// Write a file that must not already exist, then mark it read-only.
pub fn write_immutable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;

    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

fn sync_dir(dir: &Path) {
    // Directories cannot be opened for sync on every platform.
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            debug!(dir = %dir.display(), error = %e, "Directory fsync skipped");
        }
    }
}

/// Remove temp files left behind by an interrupted [`atomic_write`].
///
/// Returns the number of files removed.
pub fn recover_interrupted_writes(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if is_tmp && path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed interrupted write");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable_hex() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(b"hello\n"));
    }

    #[test]
    fn test_sanitize_task_id() {
        assert_eq!(sanitize_task_id("TASK-42_ok"), "TASK-42_ok");
        assert_eq!(sanitize_task_id("../../etc"), "______etc");
        assert_eq!(sanitize_task_id("a b/c"), "a_b_c");
        assert_eq!(sanitize_task_id(""), "task");
        assert_eq!(sanitize_task_id(&"x".repeat(100)).len(), 64);
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");

        // No temp files left behind
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_write_immutable_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.json");
        write_immutable(&path, b"frozen").unwrap();
        let err = write_immutable(&path, b"again").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
    }

    #[test]
    fn test_recover_interrupted_writes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".a.json.123.tmp"), "partial").unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        assert_eq!(recover_interrupted_writes(dir.path()), 1);
        assert!(dir.path().join("a.json").exists());
    }
}
