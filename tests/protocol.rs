//! Scan Protocol Integration Tests
//!
//! Tests for the end-to-end scan lifecycle: event ordering, terminal
//! events, persistence and rejected requests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use vantage::adapters::{Check, CheckError, CheckReport};
use vantage::core::{AdmissionDenied, Orchestrator, ScanError, TaskRegistry, ValidationError};
use vantage::domain::{AuditRequest, ProgressEvent, ScanStatus, TaskType};
use vantage::store::{ScanStore, SqliteStore};

struct FixedCheck {
    score: Option<u8>,
    delay: Duration,
}

#[async_trait]
impl Check for FixedCheck {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn run(&self, _target: &Url, _timeout: Duration) -> Result<CheckReport, CheckError> {
        tokio::time::sleep(self.delay).await;
        match self.score {
            Some(score) => Ok(CheckReport::new(score, vec![])),
            None => Err(CheckError::Upstream {
                status: 500,
                body: "scanner down".to_string(),
            }),
        }
    }
}

fn check(score: Option<u8>, delay_ms: u64) -> Arc<dyn Check> {
    Arc::new(FixedCheck {
        score,
        delay: Duration::from_millis(delay_ms),
    })
}

async fn setup(registry: TaskRegistry) -> (Orchestrator, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.set_plan("acct", 10, 3).await.unwrap();
    let orchestrator = Orchestrator::new(registry, store.clone(), store.clone());
    (orchestrator, store)
}

fn three_tasks() -> TaskRegistry {
    let timeout = Duration::from_secs(5);
    TaskRegistry::new()
        .with(TaskType::Ssl, timeout, check(Some(80), 30))
        .with(TaskType::Dns, timeout, check(None, 10))
        .with(TaskType::Cors, timeout, check(Some(60), 0))
}

async fn drain(handle: &mut vantage::core::ScanHandle) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_event_order_and_terminal_result() {
    let (orchestrator, store) = setup(three_tasks()).await;

    let mut handle = orchestrator
        .start(AuditRequest::new("https://example.com", "acct"), None)
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    assert!(matches!(events.first(), Some(ProgressEvent::Started { total_tasks: 3, .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());

    let counts: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress { completed, total, .. } => Some((*completed, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![(1, 3), (2, 3), (3, 3)]);

    let ProgressEvent::Result { overall_score, outcomes } = events.last().unwrap() else {
        panic!("expected result, got {:?}", events.last());
    };
    assert_eq!(outcomes.len(), 3);
    assert!(!outcomes[&TaskType::Dns].is_success());
    // Failed dns is excluded: (80 * 1000 + 60 * 500) / 1500 = 73.3
    assert_eq!(*overall_score, 73);

    let record = handle.run.await.unwrap();
    assert_eq!(record.status, ScanStatus::Completed);

    let stored = store.get_scan(handle.scan_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Completed);
    assert_eq!(stored.overall_score, Some(73));
    assert_eq!(stored.tasks_completed, 3);
    assert_eq!(stored.weights_version, 1);
    assert_eq!(stored.outcomes, *outcomes);
}

#[tokio::test]
async fn test_all_failed_is_completed_with_zero() {
    let timeout = Duration::from_secs(5);
    let registry = TaskRegistry::new()
        .with(TaskType::Ssl, timeout, check(None, 0))
        .with(TaskType::Xss, timeout, check(None, 5));
    let (orchestrator, store) = setup(registry).await;

    let mut handle = orchestrator
        .start(AuditRequest::new("https://example.com", "acct"), None)
        .await
        .unwrap();
    let events = drain(&mut handle).await;

    assert!(matches!(events.last(), Some(ProgressEvent::Result { overall_score: 0, .. })));

    let stored = store.get_scan(handle.scan_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Completed);
    assert_eq!(stored.overall_score, Some(0));
}

#[tokio::test]
async fn test_dropped_stream_still_persists() {
    let (orchestrator, store) = setup(three_tasks()).await;

    let handle = orchestrator
        .start(AuditRequest::new("https://example.com", "acct"), None)
        .await
        .unwrap();
    let scan_id = handle.scan_id;
    drop(handle.events);

    let record = handle.run.await.unwrap();
    assert_eq!(record.status, ScanStatus::Completed);

    let stored = store.get_scan(scan_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Completed);
    assert_eq!(stored.overall_score, Some(73));
}

#[tokio::test]
async fn test_unregistered_type_rejected_before_admission() {
    let timeout = Duration::from_secs(5);
    let registry = TaskRegistry::new().with(TaskType::Ssl, timeout, check(Some(90), 0));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.set_plan("acct", 1, 1).await.unwrap();
    let orchestrator = Orchestrator::new(registry, store.clone(), store.clone());

    let request = AuditRequest::new("https://example.com", "acct").with_tasks([TaskType::Vibe]);
    let err = orchestrator.start(request, None).await.err().unwrap();
    assert!(matches!(
        err,
        ScanError::Validation(ValidationError::UnregisteredTaskType(TaskType::Vibe))
    ));

    // Nothing was admitted, recorded or published
    let state = store.quota("acct").await.unwrap().unwrap();
    assert_eq!(state.scans_used, 0);
    assert!(state.domains.is_empty());
    assert_eq!(orchestrator.hub().len().await, 0);

    // The single-scan plan is still available
    let mut handle = orchestrator
        .start(AuditRequest::new("https://example.com", "acct"), None)
        .await
        .unwrap();
    drain(&mut handle).await;
    let record = handle.run.await.unwrap();
    assert_eq!(record.status, ScanStatus::Completed);
    assert_eq!(store.quota("acct").await.unwrap().unwrap().scans_used, 1);
}

#[tokio::test]
async fn test_project_id_is_stored() {
    let (orchestrator, store) = setup(three_tasks()).await;

    let mut request = AuditRequest::new("https://example.com", "acct");
    request.project_id = Some("marketing-site".to_string());
    let handle = orchestrator.start(request, None).await.unwrap();
    let record = handle.run.await.unwrap();
    assert_eq!(record.project_id.as_deref(), Some("marketing-site"));

    let stored = store.get_scan(handle.scan_id).await.unwrap().unwrap();
    assert_eq!(stored.project_id.as_deref(), Some("marketing-site"));
}

#[tokio::test]
async fn test_side_channel_mirrors_counters() {
    let (orchestrator, _store) = setup(three_tasks()).await;

    let mut handle = orchestrator
        .start(AuditRequest::new("https://example.com", "acct"), None)
        .await
        .unwrap();
    let events = drain(&mut handle).await;
    handle.run.await.unwrap();

    let snapshot = orchestrator.hub().latest(handle.scan_id).await.unwrap();
    assert_eq!(snapshot.status, ScanStatus::Completed);
    assert_eq!(snapshot.completed, 3);
    assert_eq!(snapshot.total, 3);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Result { overall_score, .. }) if Some(*overall_score) == snapshot.overall_score
    ));
}

#[tokio::test]
async fn test_rejections_happen_before_any_record() {
    let (orchestrator, store) = setup(three_tasks()).await;

    let err = orchestrator
        .start(AuditRequest::new("http://127.0.0.1/admin", "acct"), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ScanError::Validation(ValidationError::PrivateHost(_))));

    let empty = AuditRequest::new("https://example.com", "acct").with_tasks(BTreeSet::new());
    let err = orchestrator.start(empty, None).await.err().unwrap();
    assert!(matches!(err, ScanError::Validation(ValidationError::EmptyTaskList)));

    let allowed = vec!["other.com".to_string()];
    let err = orchestrator
        .start(AuditRequest::new("https://example.com", "acct"), Some(allowed.as_slice()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ScanError::DomainNotAllowed(_)));

    let err = orchestrator
        .start(AuditRequest::new("https://example.com", "stranger"), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ScanError::Admission(AdmissionDenied::PlanRequired)));

    // None of the rejected requests consumed quota
    let state = store.quota("acct").await.unwrap().unwrap();
    assert_eq!(state.scans_used, 0);
}
