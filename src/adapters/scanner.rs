//! HTTP scanner check.
//!
//! Each task type maps to one scanner function behind a shared base URL:
//! `POST {base}/{slug}` with the target in the body and the shared key in
//! `x-scanner-key`. Transient failures are retried with capped backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{Check, CheckError, CheckReport};
use crate::core::retry::{retry, RetryPolicy};
use crate::domain::{Finding, TaskType};

/// Header carrying the shared scanner secret
pub const SCANNER_KEY_HEADER: &str = "x-scanner-key";

/// Smallest per-attempt budget handed to the HTTP client
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Check backed by a remote scanner function
pub struct HttpCheck {
    task: TaskType,
    endpoint: String,
    key: Option<String>,
    retry_policy: RetryPolicy,
    client: reqwest::Client,
}

impl HttpCheck {
    /// Create a check for `task` against the scanner base URL
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        key: Option<String>,
        task: TaskType,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            task,
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), task.slug()),
            key,
            retry_policy,
            client,
        }
    }

    /// Full endpoint URL of this check
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Split the task budget across the allowed attempts
    fn attempt_timeout(&self, timeout: Duration) -> Duration {
        let attempts = self.retry_policy.max_attempts.max(1);
        (timeout / attempts).max(MIN_ATTEMPT_TIMEOUT)
    }

    async fn call_once(&self, target: &Url, timeout: Duration) -> Result<CheckReport, CheckError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&serde_json::json!({ "targetUrl": target.as_str() }));

        if let Some(ref key) = self.key {
            request = request.header(SCANNER_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest(e, timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest(e, timeout))?;

        if !status.is_success() {
            return Err(CheckError::Upstream {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        parse_report(&body)
    }
}

#[async_trait]
impl Check for HttpCheck {
    fn name(&self) -> &str {
        self.task.as_str()
    }

    async fn run(&self, target: &Url, timeout: Duration) -> Result<CheckReport, CheckError> {
        let per_attempt = self.attempt_timeout(timeout);
        debug!(task = %self.task, endpoint = %self.endpoint, ?per_attempt, "Calling scanner");

        retry(&self.retry_policy, self.task.as_str(), move || {
            self.call_once(target, per_attempt)
        })
        .await
    }
}

/// Wire shape returned by scanner functions
#[derive(Debug, Deserialize)]
struct ScannerResponse {
    score: Option<f64>,
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Decode a scanner response body into a report
pub fn parse_report(body: &str) -> Result<CheckReport, CheckError> {
    if body.trim().is_empty() {
        return Err(CheckError::Empty);
    }

    let response: ScannerResponse =
        serde_json::from_str(body).map_err(|e| CheckError::Malformed(e.to_string()))?;

    let score = response
        .score
        .ok_or_else(|| CheckError::Malformed("missing score".to_string()))?;

    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(CheckError::ScoreOutOfRange(score));
    }

    Ok(CheckReport::new(score.round() as u8, response.findings))
}

fn classify_reqwest(err: reqwest::Error, timeout: Duration) -> CheckError {
    if err.is_timeout() {
        CheckError::Timeout(timeout)
    } else if err.is_decode() {
        CheckError::Malformed(err.to_string())
    } else {
        CheckError::Network(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
