//! vantage - Concurrent website audit orchestrator
//!
//! Runs a fixed set of independent checks against a target URL, gates
//! every scan behind an atomic usage quota, folds the partial outcomes
//! into one weighted score and streams progress while it runs.
//!
//! # Architecture
//!
//! A scan moves through one lifecycle:
//! - Validation and the capability allowlist reject bad requests for free
//! - Admission reserves quota in a single transaction
//! - The dispatcher runs every check concurrently, each under its own timeout
//! - The aggregator scores the run only after every check has settled
//!
//! Progress is published twice from the same counters: inline as NDJSON on
//! the `POST /scan` response, and on an SSE side channel keyed by scan id.
//!
//! # Modules
//!
//! - `adapters`: Check trait and the HTTP scanner backend
//! - `core`: Validation, admission, dispatch, aggregation, progress
//! - `domain`: Data structures (TaskOutcome, ScanRecord, ProgressEvent)
//! - `store`: SQLite quota and scan persistence
//! - `server`: HTTP API
//! - `client`: NDJSON client and progress merging
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Give an account a plan
//! vantage quota set local --scans 10 --domains 2
//!
//! # Run a scan in-process
//! vantage scan https://example.com
//!
//! # Serve the HTTP API
//! vantage serve --bind 127.0.0.1:9000
//! ```

pub mod adapters;
pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, ScanError};
pub use domain::{AuditRequest, ProgressEvent, ScanRecord, ScanStatus, TaskOutcome, TaskType};
pub use store::SqliteStore;
