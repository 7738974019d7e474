//! Core orchestration logic.
//!
//! This module contains:
//! - Validation: target URL and task list checks
//! - Admission: atomic quota gate in front of every scan
//! - Registry: task types, timeouts, checks and versioned weights
//! - Dispatcher: concurrent fan-out with per-task isolation
//! - Aggregator: weighted overall score
//! - Progress: inline event stream and side-channel hub
//! - Orchestrator: ties the above into one scan lifecycle

pub mod admission;
pub mod aggregator;
pub mod dispatcher;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod validation;

// Re-export commonly used types
pub use admission::{AdmissionController, AdmissionDenied, AdmissionResult, QuotaStore};
pub use aggregator::aggregate;
pub use dispatcher::{DispatchError, Dispatcher, OutcomeStream};
pub use orchestrator::{Orchestrator, ScanError, ScanHandle};
pub use progress::{InlineReceiver, InlineSender, ProgressHub, ProgressPublisher};
pub use registry::{TaskRegistry, TaskSpec, WeightTable, WEIGHTS_V1};
pub use retry::{retry, RetryPolicy, Retryable};
pub use validation::{TargetPolicy, ValidatedTarget, ValidationError};
