//! Persistence for scans and account quotas.
//!
//! The orchestrator writes one record per scan: inserted at admission,
//! moved to running, progress counters bumped as tasks settle, then
//! completed (or failed) exactly once.

pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ScanRecord, TaskOutcome, TaskType};

pub use sqlite::SqliteStore;

/// Scan record persistence
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Insert a freshly admitted record
    async fn create_scan(&self, record: &ScanRecord) -> Result<()>;

    async fn mark_running(&self, id: Uuid) -> Result<()>;

    /// Persist the settled-task counter; never moves it backwards
    async fn record_progress(&self, id: Uuid, completed: u32) -> Result<()>;

    /// Final update. Fails if the record is already terminal.
    async fn complete_scan(
        &self,
        id: Uuid,
        overall_score: u8,
        outcomes: &BTreeMap<TaskType, TaskOutcome>,
    ) -> Result<()>;

    /// Mark a record that could not start dispatch
    async fn fail_scan(&self, id: Uuid, reason: &str) -> Result<()>;

    async fn get_scan(&self, id: Uuid) -> Result<Option<ScanRecord>>;
}

/// Quota counters for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub account_id: String,

    /// Scans consumed in `period`
    pub scans_used: u32,

    pub scans_limit: u32,

    pub domain_limit: u32,

    /// Billing period as `YYYY-MM`
    pub period: String,

    pub domains: Vec<String>,
}
