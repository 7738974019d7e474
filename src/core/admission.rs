//! Pre-flight quota admission.
//!
//! The controller never reads quota state and then writes it back. It
//! delegates to [`QuotaStore::try_admit`], which must check and consume
//! the quota as one atomic operation so concurrent requests from the same
//! account cannot both take the last slot.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Why an admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDenied {
    #[error("Domain limit reached for this plan")]
    DomainLimitReached,

    #[error("Monthly scan limit reached")]
    ScanLimitReached,

    #[error("An active plan is required to run scans")]
    PlanRequired,
}

impl AdmissionDenied {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionDenied::DomainLimitReached => "domain_limit_reached",
            AdmissionDenied::ScanLimitReached => "scan_limit_reached",
            AdmissionDenied::PlanRequired => "plan_required",
        }
    }
}

/// Outcome of one admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub allowed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<AdmissionDenied>,
}

impl AdmissionResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: AdmissionDenied) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<(), AdmissionDenied> {
        match self.reason {
            Some(reason) if !self.allowed => Err(reason),
            _ => Ok(()),
        }
    }
}

/// Usage counters and registered domains per account.
///
/// `try_admit` registers `domain` (if new and there is room) and consumes
/// one scan in a single atomic step. A denial must leave state unchanged.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn try_admit(&self, account_id: &str, domain: &str) -> Result<AdmissionResult>;
}

/// Gate in front of the dispatcher
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn QuotaStore>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Check and consume quota for one scan of `domain`
    pub async fn admit(&self, account_id: &str, domain: &str) -> Result<AdmissionResult> {
        let result = self.store.try_admit(account_id, domain).await?;

        match result.reason {
            None => info!(%account_id, %domain, "Scan admitted"),
            Some(reason) => warn!(%account_id, %domain, reason = reason.code(), "Scan denied"),
        }

        Ok(result)
    }
}
