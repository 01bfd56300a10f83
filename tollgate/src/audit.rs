//! Append-only transition log (`transitions.jsonl`).
//!
//! One JSON object per line. Lines are never rewritten; readers may run
//! concurrently with the single in-process appender.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::contract::types::TaskStatus;
use crate::error::GateResult;
use crate::state_machine::{transition, TaskEvent};

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub event: TaskEvent,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub attempt: u32,
}

/// A logged transition that replay could not reproduce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayMismatch {
    /// The table maps the pair somewhere else.
    Diverged {
        line: usize,
        task_id: String,
        expected: TaskStatus,
        logged: TaskStatus,
    },
    /// The table has no edge for the logged pair.
    NoEdge {
        line: usize,
        task_id: String,
        from: TaskStatus,
        event: TaskEvent,
    },
    /// The entry does not start where the task's previous entry ended.
    ChainBreak {
        line: usize,
        task_id: String,
        previous: TaskStatus,
        logged_from: TaskStatus,
    },
}

/// Result of replaying the whole log through the transition table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub entries_checked: usize,
    pub tasks_seen: usize,
    pub malformed_lines: usize,
    pub mismatches: Vec<ReplayMismatch>,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.malformed_lines == 0
    }
}

/// Append-only JSON-lines log of transitions.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    /// Open (without creating) the log at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, entry: &TransitionLogEntry) -> GateResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        // The guard protects no data, so a poisoned lock is still usable.
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Append several entries in order.
    pub fn append_all(&self, entries: &[TransitionLogEntry]) -> GateResult<()> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Read all entries. Malformed lines (e.g. a torn final write) are skipped.
    pub fn read_all(&self) -> GateResult<Vec<TransitionLogEntry>> {
        Ok(self.read_lines()?.0.into_iter().map(|(_, e)| e).collect())
    }

    /// Entries for one task, in log order.
    pub fn entries_for(&self, task_id: &str) -> GateResult<Vec<TransitionLogEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect())
    }

    /// Replay every `(old_status, event)` through the transition table and
    /// check that it reproduces the logged `new_status`, and that each task's
    /// entries form an unbroken chain.
    pub fn verify_replay(&self) -> GateResult<ReplayReport> {
        let (entries, malformed) = self.read_lines()?;
        let mut report = ReplayReport {
            malformed_lines: malformed,
            ..ReplayReport::default()
        };
        let mut last_status: HashMap<String, TaskStatus> = HashMap::new();

        for (line, entry) in entries {
            report.entries_checked += 1;

            if let Some(previous) = last_status.get(&entry.task_id) {
                if *previous != entry.old_status {
                    report.mismatches.push(ReplayMismatch::ChainBreak {
                        line,
                        task_id: entry.task_id.clone(),
                        previous: *previous,
                        logged_from: entry.old_status,
                    });
                }
            }

            match transition(entry.old_status, entry.event) {
                Ok((expected, _)) if expected != entry.new_status => {
                    report.mismatches.push(ReplayMismatch::Diverged {
                        line,
                        task_id: entry.task_id.clone(),
                        expected,
                        logged: entry.new_status,
                    });
                }
                Ok(_) => {}
                Err(_) => report.mismatches.push(ReplayMismatch::NoEdge {
                    line,
                    task_id: entry.task_id.clone(),
                    from: entry.old_status,
                    event: entry.event,
                }),
            }

            last_status.insert(entry.task_id, entry.new_status);
        }

        report.tasks_seen = last_status.len();
        Ok(report)
    }

    fn read_lines(&self) -> GateResult<(Vec<(usize, TransitionLogEntry)>, usize)> {
        if !self.path.exists() {
            return Ok((Vec::new(), 0));
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        let mut malformed = 0;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransitionLogEntry>(&line) {
                Ok(entry) => entries.push((idx + 1, entry)),
                Err(e) => {
                    warn!(line = idx + 1, error = %e, "Skipping malformed transition log line");
                    malformed += 1;
                }
            }
        }
        Ok((entries, malformed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(task: &str, event: TaskEvent, from: TaskStatus, to: TaskStatus) -> TransitionLogEntry {
        TransitionLogEntry {
            timestamp: Utc::now(),
            task_id: task.to_string(),
            event,
            old_status: from,
            new_status: to,
            attempt: 1,
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("transitions.jsonl"));

        log.append(&entry(
            "a",
            TaskEvent::ImplementerStarted,
            TaskStatus::PendingImplementer,
            TaskStatus::ImplementationInProgress,
        ))
        .unwrap();
        log.append(&entry(
            "b",
            TaskEvent::Escalated,
            TaskStatus::PendingImplementer,
            TaskStatus::ErikConsultation,
        ))
        .unwrap();

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(log.entries_for("b").unwrap().len(), 1);
        assert_eq!(all[0].event, TaskEvent::ImplementerStarted);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("none.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
        assert!(log.verify_replay().unwrap().is_clean());
    }

    #[test]
    fn test_replay_detects_divergence_and_chain_breaks() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("transitions.jsonl"));

        log.append(&entry(
            "a",
            TaskEvent::ImplementerStarted,
            TaskStatus::PendingImplementer,
            TaskStatus::ImplementationInProgress,
        ))
        .unwrap();
        // Wrong destination
        log.append(&entry(
            "a",
            TaskEvent::ImplementationSubmitted,
            TaskStatus::ImplementationInProgress,
            TaskStatus::Merged,
        ))
        .unwrap();
        // Starts from a status the task was never in
        log.append(&entry(
            "a",
            TaskEvent::JudgeReviewStarted,
            TaskStatus::PendingJudgeReview,
            TaskStatus::JudgeReviewInProgress,
        ))
        .unwrap();

        let report = log.verify_replay().unwrap();
        assert_eq!(report.entries_checked, 3);
        assert_eq!(report.tasks_seen, 1);
        assert_eq!(report.mismatches.len(), 2);
        assert!(matches!(
            report.mismatches[0],
            ReplayMismatch::Diverged { line: 2, expected: TaskStatus::PendingLocalReview, .. }
        ));
        assert!(matches!(report.mismatches[1], ReplayMismatch::ChainBreak { line: 3, .. }));
    }

    #[test]
    fn test_torn_line_is_counted_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transitions.jsonl");
        let log = AuditLog::new(&path);
        log.append(&entry(
            "a",
            TaskEvent::ImplementerStarted,
            TaskStatus::PendingImplementer,
            TaskStatus::ImplementationInProgress,
        ))
        .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"timestamp\":\"2024").unwrap();

        assert_eq!(log.read_all().unwrap().len(), 1);
        let report = log.verify_replay().unwrap();
        assert_eq!(report.malformed_lines, 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_concurrent_appends_keep_lines_whole() {
        let dir = tempdir().unwrap();
        let log = std::sync::Arc::new(AuditLog::new(dir.path().join("transitions.jsonl")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        log.append(&entry(
                            &format!("task-{i}"),
                            TaskEvent::Escalated,
                            TaskStatus::PendingImplementer,
                            TaskStatus::ErikConsultation,
                        ))
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let (entries, malformed) = log.read_lines().unwrap();
        assert_eq!(entries.len(), 80);
        assert_eq!(malformed, 0);
    }
}
