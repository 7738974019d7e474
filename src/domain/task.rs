//! Task types and the outcome each task settles into.
//!
//! A task is one independent check run against the target URL. Its
//! outcome is decided once, at the task boundary, and never re-inspected
//! as an untyped blob afterwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registered check kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// HTTP security response headers
    SecurityHeaders,

    /// TLS certificate and protocol configuration
    Ssl,

    /// DNS records (SPF, DMARC, CAA, dangling records)
    Dns,

    /// Cross-origin resource sharing policy
    Cors,

    /// Cookie flags on session-like cookies
    Cookies,

    /// Cross-site request forgery protections
    Csrf,

    /// Secrets and API keys exposed in client bundles
    ApiKeys,

    /// Reflected cross-site scripting probes
    Xss,

    /// SQL injection probes
    Sqli,

    /// Technology fingerprinting and outdated components
    Tech,

    /// Open redirect probes
    Redirect,

    /// Exposed debug and admin endpoints
    DebugEndpoints,

    /// Legal pages classification (AI-backed)
    Legal,

    /// Vibe-coded application heuristics (AI-backed)
    Vibe,
}

impl TaskType {
    /// Every registered task type, in display order
    pub const ALL: [TaskType; 14] = [
        TaskType::SecurityHeaders,
        TaskType::Ssl,
        TaskType::Dns,
        TaskType::Cors,
        TaskType::Cookies,
        TaskType::Csrf,
        TaskType::ApiKeys,
        TaskType::Xss,
        TaskType::Sqli,
        TaskType::Tech,
        TaskType::Redirect,
        TaskType::DebugEndpoints,
        TaskType::Legal,
        TaskType::Vibe,
    ];

    /// Wire name (snake_case)
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SecurityHeaders => "security_headers",
            TaskType::Ssl => "ssl",
            TaskType::Dns => "dns",
            TaskType::Cors => "cors",
            TaskType::Cookies => "cookies",
            TaskType::Csrf => "csrf",
            TaskType::ApiKeys => "api_keys",
            TaskType::Xss => "xss",
            TaskType::Sqli => "sqli",
            TaskType::Tech => "tech",
            TaskType::Redirect => "redirect",
            TaskType::DebugEndpoints => "debug_endpoints",
            TaskType::Legal => "legal",
            TaskType::Vibe => "vibe",
        }
    }

    /// Backend function slug, e.g. `security-headers-scanner`
    pub fn slug(&self) -> String {
        format!("{}-scanner", self.as_str().replace('_', "-"))
    }

    /// Whether the backing check calls an AI classification service
    pub fn is_ai_backed(&self) -> bool {
        matches!(self, TaskType::Legal | TaskType::Vibe)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}

/// Severity levels shared by all findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// A single issue reported by a check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable identifier for the finding kind (e.g. "missing-hsts")
    pub id: String,

    pub severity: Severity,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,

    /// Supporting data, e.g. the header value that triggered the finding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl Finding {
    pub fn new(id: impl Into<String>, severity: Severity, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            title: title.into(),
            description: None,
            recommendation: None,
            evidence: None,
        }
    }
}

/// Reason recorded when a task exceeds its timeout
pub const TIMEOUT_REASON: &str = "timeout";

/// Terminal result of one task.
///
/// A `Failure` carries no score and is excluded from aggregation; it is
/// never treated as a score of zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { score: u8, findings: Vec<Finding> },
    Failure { reason: String },
}

impl TaskOutcome {
    /// Successful outcome; the score is clamped into 0..=100
    pub fn success(score: u8, findings: Vec<Finding>) -> Self {
        Self::Success {
            score: score.min(100),
            findings,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::failure(TIMEOUT_REASON)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Score if the task succeeded
    pub fn score(&self) -> Option<u8> {
        match self {
            Self::Success { score, .. } => Some(*score),
            Self::Failure { .. } => None,
        }
    }
}
