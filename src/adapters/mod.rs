//! Check interfaces for external scanner backends.
//!
//! Every task type is backed by one implementation of [`Check`]. The
//! detection logic lives behind it; the orchestrator only relies on the
//! contract: bounded time, then a score with findings or an error.

pub mod scanner;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::core::retry::Retryable;
use crate::domain::{Finding, TaskOutcome};

// Re-export the HTTP scanner check
pub use scanner::{parse_report, HttpCheck};

/// Output of a successful check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Score in 0..=100
    pub score: u8,

    /// Issues found
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn new(score: u8, findings: Vec<Finding>) -> Self {
        Self { score, findings }
    }
}

impl From<CheckReport> for TaskOutcome {
    fn from(report: CheckReport) -> Self {
        TaskOutcome::success(report.score, report.findings)
    }
}

/// Errors a check can fail with
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Empty response from upstream")]
    Empty,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Score out of range: {0}")]
    ScoreOutOfRange(f64),
}

impl Retryable for CheckError {
    fn is_retryable(&self) -> bool {
        match self {
            CheckError::Timeout(_)
            | CheckError::Network(_)
            | CheckError::Empty
            | CheckError::Malformed(_) => true,
            CheckError::Upstream { status, .. } => *status == 429 || *status >= 500,
            CheckError::ScoreOutOfRange(_) => false,
        }
    }
}

/// One independent check run against a target
#[async_trait]
pub trait Check: Send + Sync {
    /// Human-readable check name
    fn name(&self) -> &str;

    /// Run the check. Implementations should honour `timeout`; the
    /// dispatcher enforces it regardless.
    async fn run(&self, target: &Url, timeout: Duration) -> Result<CheckReport, CheckError>;
}
