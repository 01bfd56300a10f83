//! Gate error types
//!
//! One taxonomy for every failure the core library can surface. Validation
//! and conflict errors stay local to a single task; the orchestrator turns
//! them into gate decisions or a halt instead of stopping the process.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerTrigger;
use crate::contract::types::{Phase, TaskStatus};
use crate::state_machine::TaskEvent;

/// Result type alias for gate operations
pub type GateResult<T> = Result<T, GateError>;

/// Machine-readable error shape handed to operators and workers.
///
/// ```json
/// {
///   "code": "CONFLICT",
///   "message": "Conflict on task-7: stored version 4 is newer than 3",
///   "recovery_action": "Reload the contract and re-apply the change",
///   "context": { "task_id": "task-7" },
///   "retryable": true
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable code such as `VALIDATION_FAILED`.
    pub code: String,

    /// Display text.
    pub message: String,

    /// What the operator should do next.
    pub recovery_action: String,

    /// Task id, attempt, paths and the like.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_task(self, task_id: &str, attempt: u32) -> Self {
        self.with_context("task_id", task_id.to_string())
            .with_context("attempt", attempt)
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Every failure the core library reports.
#[derive(Error, Debug)]
pub enum GateError {
    /// Path or content rejected. Always fail closed.
    #[error("Validation failed for {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    /// No entry in the transition table for this (status, event) pair
    #[error("Invalid transition: no edge from {from} on {event}")]
    InvalidTransition { from: TaskStatus, event: TaskEvent },

    /// Stale write or content hash mismatch
    #[error("Conflict on {task_id}: {message}")]
    Conflict { task_id: String, message: String },

    /// Task lock is held by an unexpired holder
    #[error("Lock on {task_id} held by {holder} until {expires_at}")]
    LockHeld {
        task_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// A worker call exceeded its phase budget
    #[error("Phase {phase} timed out after {seconds}s")]
    Timeout { phase: Phase, seconds: u64 },

    /// A safety predicate halted the task
    #[error("Circuit breaker {trigger} tripped for {task_id}: {reason}")]
    CircuitBreakerTripped {
        task_id: String,
        trigger: BreakerTrigger,
        reason: String,
    },

    /// Contract, archive entry or artifact missing
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Refusing to overwrite an existing record
    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GateError {
    /// Create a validation error
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an already exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Conflict { .. } => "CONFLICT",
            Self::LockHeld { .. } => "LOCK_HELD",
            Self::Timeout { .. } => "PHASE_TIMEOUT",
            Self::CircuitBreakerTripped { .. } => "CIRCUIT_BREAKER_TRIPPED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Transient failures worth retrying as-is: lock contention, stale
    /// versions and interrupted I/O.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Refresh and try again
            Self::Conflict { .. } => true,
            // Wait for expiry or release
            Self::LockHeld { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Operator-facing next step.
    pub fn recovery_suggestion(&self) -> String {
        match self {
            Self::Validation { path, .. } => format!(
                "Path {} was refused by the sandbox validator. Point the draft at a workspace \
                 file that is not credential-like and keep drafts inside the sandbox root.",
                path.display()
            ),
            Self::InvalidTransition { from, .. } => format!(
                "The task is in {from}. Check `tollgate status` and feed an event that has an \
                 edge from this status."
            ),
            Self::Conflict { .. } => {
                "Reload the contract (or re-read the target file) and re-apply the change."
                    .to_string()
            }
            Self::LockHeld { expires_at, .. } => format!(
                "Another actor owns this task. Wait for release or for expiry at {expires_at}."
            ),
            Self::Timeout { phase, .. } => format!(
                "Raise limits.timeouts.{phase} or split the task; the timeout is recorded as a \
                 state event."
            ),
            Self::CircuitBreakerTripped { task_id, .. } => format!(
                "Read the halt report for {task_id}, fix the cause, then run \
                 `tollgate reset {task_id}` to start a new attempt."
            ),
            Self::NotFound { .. } => {
                "Verify the task id with `tollgate status` and check the state directory."
                    .to_string()
            }
            Self::AlreadyExists { .. } => {
                "Pick a new task id; existing contracts and archives are never overwritten."
                    .to_string()
            }
            Self::Config { .. } => {
                "Check tollgate.toml and the TOLLGATE_* environment variables.".to_string()
            }
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => {
                    "File or directory not found. Check the path exists.".to_string()
                }
                std::io::ErrorKind::PermissionDenied => {
                    "Permission denied. Check file permissions: ls -la <path>".to_string()
                }
                _ => "IO error occurred. Check disk space and file permissions.".to_string(),
            },
            Self::Json(_) => {
                "JSON parsing failed. The record may be corrupted or carry unknown fields."
                    .to_string()
            }
        }
    }

    pub fn with_suggestion(&self) -> String {
        format!("{}\n\nRecovery: {}", self, self.recovery_suggestion())
    }

    /// Convert to structured error
    pub fn to_structured(&self) -> StructuredError {
        let mut structured =
            StructuredError::new(self.code(), self.to_string(), self.recovery_suggestion());

        match self {
            Self::Conflict { task_id, .. }
            | Self::LockHeld { task_id, .. }
            | Self::CircuitBreakerTripped { task_id, .. } => {
                structured = structured.with_context("task_id", task_id.clone());
            }
            Self::Validation { path, .. } => {
                structured = structured.with_context("path", path.display().to_string());
            }
            _ => {}
        }

        if self.is_retryable() {
            structured = structured.retryable();
        }

        structured
    }
}
