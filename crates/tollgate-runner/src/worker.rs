//! Worker protocol and the HTTP connection that carries it.
//!
//! Requests and responses are a closed set of tagged JSON variants. Every
//! response struct refuses unknown fields, so a worker that drifts from the
//! protocol fails at the boundary instead of half-parsing into a contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate::contract::{Constraints, Finding, JudgeVerdict, LocalVerdict, ModelTier};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Implementer,
    LocalReviewer,
    Judge,
    Rebutter,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Implementer => write!(f, "implementer"),
            Self::LocalReviewer => write!(f, "local_reviewer"),
            Self::Judge => write!(f, "judge"),
            Self::Rebutter => write!(f, "rebutter"),
        }
    }
}

/// One call to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkerRequest {
    pub task_id: String,
    pub role: WorkerRole,
    pub model_tier: ModelTier,
    /// Prompt body: requirements, diff, findings, depending on the role.
    pub content: String,
    pub constraints: Constraints,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Usage {
    pub tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ImplementationReport {
    pub success: bool,
    /// Sandbox-relative submission records staged by the worker.
    #[serde(default)]
    pub drafts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LocalReviewReport {
    pub verdict: LocalVerdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JudgeReviewReport {
    pub verdict: JudgeVerdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RebuttalStance {
    /// Argue the judge's findings.
    Rebut { text: String },
    /// Accept the findings and rework.
    Concede,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RebuttalReport {
    pub stance: RebuttalStance,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StallReport {
    pub reason: String,
    #[serde(default)]
    pub usage: Usage,
}

/// Everything a worker may answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResponse {
    Implementation(ImplementationReport),
    LocalReview(LocalReviewReport),
    JudgeReview(JudgeReviewReport),
    Rebuttal(RebuttalReport),
    Stalled(StallReport),
}

impl WorkerResponse {
    pub fn usage(&self) -> Usage {
        match self {
            Self::Implementation(r) => r.usage,
            Self::LocalReview(r) => r.usage,
            Self::JudgeReview(r) => r.usage,
            Self::Rebuttal(r) => r.usage,
            Self::Stalled(r) => r.usage,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Implementation(_) => "implementation",
            Self::LocalReview(_) => "local_review",
            Self::JudgeReview(_) => "judge_review",
            Self::Rebuttal(_) => "rebuttal",
            Self::Stalled(_) => "stalled",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker connection failed: {0}")]
    Connection(String),

    #[error("worker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response did not parse as a protocol variant.
    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("worker connection is closed")]
    Closed,

    #[error("worker call timed out after {0}s")]
    Timeout(u64),

    #[error("worker task failed: {0}")]
    Join(String),
}

impl WorkerError {
    /// Transient failures worth another attempt on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Protocol(_) | Self::Closed | Self::Join(_) => false,
        }
    }
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

// ============================================================================
// Worker seam
// ============================================================================

/// An implementer, reviewer or judge reachable by the orchestrator.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError>;
}

/// Long-lived HTTP connection to a worker service.
///
/// `POST {url}/invoke` carries a [`WorkerRequest`]; `GET {url}/health` is the
/// liveness probe used by `open` and by reconnects.
pub struct HttpWorker {
    client: reqwest::Client,
    base_url: String,
    config: WorkerConfig,
    open: AtomicBool,
}

impl HttpWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| WorkerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config: config.clone(),
            open: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Probe the service until it answers, backing off between attempts.
    pub async fn open(&self) -> Result<(), WorkerError> {
        let mut last_error = WorkerError::Closed;
        for attempt in 0..=self.config.max_reconnect_attempts {
            match self.probe().await {
                Ok(()) => {
                    self.open.store(true, Ordering::Release);
                    info!(url = %self.base_url, attempt, "Worker connection open");
                    return Ok(());
                }
                Err(e) => {
                    warn!(url = %self.base_url, attempt, error = %e, "Health check failed");
                    last_error = e;
                    if attempt < self.config.max_reconnect_attempts {
                        let delay = self.config.reconnect_base_delay_ms * (1 << attempt.min(10));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!(url = %self.base_url, "Worker connection closed");
        }
    }

    async fn probe(&self) -> Result<(), WorkerError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| WorkerError::Connection(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::Http {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }

    async fn post(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let response = self
            .client
            .post(format!("{}/invoke", self.base_url))
            .timeout(Duration::from_secs(request.timeout_seconds.max(1)))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerError::Timeout(request.timeout_seconds)
                } else {
                    WorkerError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| WorkerError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(WorkerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        parse_response(&body)
    }
}

#[async_trait]
impl Worker for HttpWorker {
    async fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        if !self.is_open() {
            self.open().await?;
        }
        debug!(
            task_id = %request.task_id,
            role = %request.role,
            tier = %request.model_tier,
            "Invoking worker"
        );

        match self.post(request).await {
            Err(WorkerError::Connection(e)) => {
                warn!(task_id = %request.task_id, error = %e, "Worker connection lost");
                self.open.store(false, Ordering::Release);
                self.open().await?;
                self.post(request).await
            }
            other => other,
        }
    }
}

/// Parse a response body, refusing anything outside the protocol.
pub fn parse_response(body: &str) -> Result<WorkerResponse, WorkerError> {
    serde_json::from_str(body).map_err(|e| WorkerError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate::contract::FindingSeverity;

    #[test]
    fn test_parse_each_variant() {
        let cases = [
            (
                r#"{"kind":"implementation","success":true,"drafts":["t__lib.rs.submission.json"],"usage":{"tokens":10,"cost_usd":0.01}}"#,
                "implementation",
            ),
            (
                r#"{"kind":"local_review","verdict":"minor_issues","findings":[{"severity":"style","message":"naming"}]}"#,
                "local_review",
            ),
            (r#"{"kind":"judge_review","verdict":"fail"}"#, "judge_review"),
            (
                r#"{"kind":"rebuttal","stance":{"rebut":{"text":"the test covers it"}}}"#,
                "rebuttal",
            ),
            (r#"{"kind":"rebuttal","stance":"concede"}"#, "rebuttal"),
            (r#"{"kind":"stalled","reason":"cannot compile"}"#, "stalled"),
        ];
        for (body, kind) in cases {
            let response = parse_response(body).unwrap();
            assert_eq!(response.kind(), kind, "{body}");
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = parse_response(r#"{"kind":"judge_review","verdict":"pass","confidence":0.9}"#)
            .unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));

        let err = parse_response(r#"{"kind":"approve"}"#).unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
    }

    #[test]
    fn test_finding_severity_parsed() {
        let response = parse_response(
            r#"{"kind":"judge_review","verdict":"fail","findings":[{"severity":"blocking","message":"panics","file":"src/lib.rs"}],"usage":{"tokens":5}}"#,
        )
        .unwrap();
        let WorkerResponse::JudgeReview(report) = response else {
            panic!("wrong variant");
        };
        assert_eq!(report.findings[0].severity, FindingSeverity::Blocking);
        assert_eq!(report.usage.tokens, 5);
        assert_eq!(report.usage.cost_usd, 0.0);
    }

    #[test]
    fn test_error_retry_classification() {
        assert!(WorkerError::Connection("refused".into()).is_retryable());
        assert!(WorkerError::Timeout(30).is_retryable());
        assert!(WorkerError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(WorkerError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!WorkerError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!WorkerError::Protocol("bad".into()).is_retryable());
    }

    #[test]
    fn test_request_serializes_role_and_tier() {
        let request = WorkerRequest {
            task_id: "t1".into(),
            role: WorkerRole::LocalReviewer,
            model_tier: ModelTier::Strong,
            content: "review this".into(),
            constraints: Constraints::default(),
            timeout_seconds: 300,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["role"], "local_reviewer");
        assert_eq!(json["model_tier"], "strong");
    }

    #[tokio::test]
    async fn test_open_fails_against_dead_endpoint() {
        let worker = HttpWorker::new(&WorkerConfig {
            url: "http://127.0.0.1:9".into(),
            connect_timeout_secs: 1,
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: 1,
        })
        .unwrap();
        assert!(!worker.is_open());
        assert!(worker.open().await.is_err());
        assert!(!worker.is_open());
        worker.close();
    }
}
