//! Progress events shared by the inline NDJSON stream and the side channel.
//!
//! Every run emits exactly one `Started` first and exactly one terminal
//! event (`Result` or `Error`) last, with zero or more `Progress` events
//! in between.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scan::{ScanRecord, ScanStatus};
use super::task::{TaskOutcome, TaskType};

/// One line of the scan event protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    /// First event of every run; carries the id for out-of-band subscribers
    Started { scan_id: Uuid, total_tasks: u32 },

    /// A task settled; `completed` never decreases and never exceeds `total`
    Progress {
        completed: u32,
        total: u32,
        task: TaskType,
    },

    /// Terminal: every task settled and the score was computed
    Result {
        overall_score: u8,
        outcomes: BTreeMap<TaskType, TaskOutcome>,
    },

    /// Terminal: the run could not be carried out after admission
    Error { message: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Result { .. } | ProgressEvent::Error { .. })
    }

    /// Serialize as one newline-terminated JSON line
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Snapshot pushed to side-channel subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub scan_id: Uuid,

    pub completed: u32,

    pub total: u32,

    pub status: ScanStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<u8>,
}

impl ProgressUpdate {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&ScanRecord> for ProgressUpdate {
    fn from(record: &ScanRecord) -> Self {
        Self {
            scan_id: record.id,
            completed: record.tasks_completed,
            total: record.tasks_total,
            status: record.status,
            overall_score: record.overall_score,
        }
    }
}
