//! Scan requests and the one record the orchestrator persists per scan.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskOutcome, TaskType};

/// An admitted audit request. Immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRequest {
    pub target_url: String,

    pub account_id: String,

    /// Task types to run; `None` means every registered type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_task_types: Option<BTreeSet<TaskType>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl AuditRequest {
    pub fn new(target_url: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            account_id: account_id.into(),
            enabled_task_types: None,
            project_id: None,
        }
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = TaskType>) -> Self {
        self.enabled_task_types = Some(tasks.into_iter().collect());
        self
    }
}

/// Lifecycle of a scan record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScanStatus::Pending),
            "running" => Some(ScanStatus::Running),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

/// Persisted state of one scan.
///
/// A scan where every task failed is still `Completed` with an
/// `overall_score` of 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: Uuid,

    pub account_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    pub target_url: String,

    pub status: ScanStatus,

    pub overall_score: Option<u8>,

    pub outcomes: BTreeMap<TaskType, TaskOutcome>,

    /// Version of the weight table the score was computed with
    pub weights_version: u32,

    pub tasks_completed: u32,

    pub tasks_total: u32,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Why the run could not start, for `Failed` records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanRecord {
    /// A fresh pending record for an admitted request
    pub fn pending(
        id: Uuid,
        account_id: impl Into<String>,
        target_url: impl Into<String>,
        tasks_total: u32,
        weights_version: u32,
    ) -> Self {
        Self {
            id,
            account_id: account_id.into(),
            project_id: None,
            target_url: target_url.into(),
            status: ScanStatus::Pending,
            overall_score: None,
            outcomes: BTreeMap::new(),
            weights_version,
            tasks_completed: 0,
            tasks_total,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}
