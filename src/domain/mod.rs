//! Domain types for the vantage orchestrator.
//!
//! This module contains the core data structures:
//! - Task: task types, findings and per-task outcomes
//! - Scan: audit requests and the persisted scan record
//! - Events: progress protocol events and side-channel snapshots

pub mod events;
pub mod scan;
pub mod task;

// Re-export commonly used types
pub use events::{ProgressEvent, ProgressUpdate};
pub use scan::{AuditRequest, ScanRecord, ScanStatus};
pub use task::{Finding, Severity, TaskOutcome, TaskType, UnknownTaskType, TIMEOUT_REASON};
