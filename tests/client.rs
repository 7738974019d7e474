//! Client Integration Tests
//!
//! Tests for the NDJSON client and the SSE side channel against a live
//! server, and for monotonic progress merging.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use url::Url;
use vantage::adapters::{Check, CheckError, CheckReport};
use vantage::client::{ProgressMerger, ScanClient};
use vantage::core::{Orchestrator, TaskRegistry};
use uuid::Uuid;
use vantage::domain::{ProgressEvent, ScanRecord, ScanStatus, TaskOutcome, TaskType};
use vantage::server::{build_router, AppState};
use vantage::store::{ScanStore, SqliteStore};

struct SlowCheck(u8, Duration);

#[async_trait]
impl Check for SlowCheck {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(&self, _target: &Url, _timeout: Duration) -> Result<CheckReport, CheckError> {
        tokio::time::sleep(self.1).await;
        Ok(CheckReport::new(self.0, vec![]))
    }
}

async fn spawn_server() -> String {
    spawn_server_with_store().await.0
}

async fn spawn_server_with_store() -> (String, Arc<SqliteStore>) {
    let timeout = Duration::from_secs(5);
    let registry = TaskRegistry::new()
        .with(TaskType::Ssl, timeout, Arc::new(SlowCheck(100, Duration::from_millis(50))))
        .with(TaskType::Dns, timeout, Arc::new(SlowCheck(50, Duration::from_millis(100))))
        .with(TaskType::Xss, timeout, Arc::new(SlowCheck(0, Duration::ZERO)));

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.set_plan("acct", 10, 10).await.unwrap();
    let router = build_router(AppState::new(Orchestrator::new(registry, store.clone(), store.clone())));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), store)
}

#[tokio::test]
async fn test_submit_reads_stream_to_result() {
    let base = spawn_server().await;
    let client = ScanClient::new(&base, "acct");

    let mut events = client.submit("https://example.com", None).await.unwrap();

    let mut merger = ProgressMerger::new(Duration::from_secs(60), 90.0, Instant::now());
    let mut shown = Vec::new();
    let mut scan_id = None;
    let mut final_score = None;

    while let Some(event) = events.next().await {
        match event.unwrap() {
            ProgressEvent::Started { scan_id: id, total_tasks } => {
                assert_eq!(total_tasks, 3);
                scan_id = Some(id);
            }
            ProgressEvent::Progress { completed, total, .. } => {
                shown.push(merger.on_update(completed, total));
            }
            ProgressEvent::Result { overall_score, .. } => {
                shown.push(merger.on_complete());
                final_score = Some(overall_score);
            }
            ProgressEvent::Error { message } => panic!("scan failed: {}", message),
        }
    }

    assert!(shown.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(shown.last().copied(), Some(100.0));

    // (100 * 1000 + 50 * 500 + 0 * 1000) / 2500 = 50
    assert_eq!(final_score, Some(50));

    let record = client.get_scan(scan_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Completed);
    assert_eq!(record.overall_score, Some(50));
}

#[tokio::test]
async fn test_side_channel_replays_terminal_snapshot() {
    let base = spawn_server().await;
    let client = ScanClient::new(&base, "acct");

    let mut events = client.submit("https://example.com", Some(vec!["ssl".to_string()])).await.unwrap();
    let Some(Ok(ProgressEvent::Started { scan_id, .. })) = events.next().await else {
        panic!("first event must be started");
    };
    while events.next().await.is_some() {}

    // Finished scan: one snapshot, then the stream closes
    let body = reqwest::Client::new()
        .get(format!("{}/scan/{}/events", base, scan_id))
        .header("x-account-id", "acct")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body
        .lines()
        .any(|l| l.starts_with("event:") && l.trim_end().ends_with("completed")));
    assert!(body.contains("\"completed\":1"));
    assert!(body.contains("\"overallScore\":100"));
}

#[tokio::test]
async fn test_follow_side_channel_after_first_line() {
    let base = spawn_server().await;
    let client = ScanClient::new(&base, "acct");

    let mut events = client.submit("https://example.com", None).await.unwrap();
    let Some(Ok(ProgressEvent::Started { scan_id, .. })) = events.next().await else {
        panic!("first event must be started");
    };
    drop(events);

    let mut updates = client.follow(scan_id).await.unwrap();
    let mut merger = ProgressMerger::new(Duration::from_secs(60), 90.0, Instant::now());
    let mut shown = Vec::new();
    let mut last = None;

    while let Some(update) = updates.next().await {
        let update = update.unwrap();
        assert_eq!(update.scan_id, scan_id);
        assert_eq!(update.total, 3);
        shown.push(if update.is_terminal() {
            merger.on_complete()
        } else {
            merger.on_update(update.completed, update.total)
        });
        last = Some(update);
    }

    assert!(!shown.is_empty());
    assert!(shown.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(shown.last().copied(), Some(100.0));

    let last = last.unwrap();
    assert_eq!(last.status, ScanStatus::Completed);
    assert_eq!(last.completed, 3);
    assert_eq!(last.overall_score, Some(50));
}

#[tokio::test]
async fn test_side_channel_polls_store_for_unhosted_scan() {
    let (base, store) = spawn_server_with_store().await;
    let client = ScanClient::new(&base, "acct");

    // A scan run by some other process: only the shared store sees it
    let scan_id = Uuid::new_v4();
    let record = ScanRecord::pending(scan_id, "acct", "https://example.com/", 2, 1);
    store.create_scan(&record).await.unwrap();

    let writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.mark_running(scan_id).await.unwrap();
        writer.record_progress(scan_id, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        let mut outcomes = BTreeMap::new();
        outcomes.insert(TaskType::Ssl, TaskOutcome::success(88, vec![]));
        outcomes.insert(TaskType::Dns, TaskOutcome::timeout());
        writer.complete_scan(scan_id, 88, &outcomes).await.unwrap();
    });

    let updates: Vec<_> = client
        .subscribe(scan_id)
        .await
        .unwrap()
        .map(|u| u.unwrap())
        .collect()
        .await;

    assert_eq!(updates.first().map(|u| u.status), Some(ScanStatus::Pending));
    assert!(updates.windows(2).all(|w| w[0].completed <= w[1].completed));

    let last = updates.last().unwrap();
    assert_eq!(last.status, ScanStatus::Completed);
    assert_eq!(last.completed, 2);
    assert_eq!(last.overall_score, Some(88));
}

#[tokio::test]
async fn test_rejected_submit_reports_error() {
    let base = spawn_server().await;

    let err = ScanClient::new(&base, "nobody")
        .submit("https://example.com", None)
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("402"));
}

#[test]
fn test_merge_never_regresses() {
    let start = Instant::now();
    let mut merger = ProgressMerger::new(Duration::from_secs(20), 90.0, start);

    // Deterministic interleaving of ticks and out-of-order updates
    let mut seed: u64 = 0x5eed;
    let mut last = 0.0;
    for step in 0..500u64 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let shown = match seed >> 62 {
            0 | 1 => merger.tick(start + Duration::from_millis(step * 37)),
            _ => {
                let total = 14;
                let completed = ((seed >> 32) % 15) as u32;
                merger.on_update(completed, total)
            }
        };
        assert!(shown >= last, "step {} went from {} to {}", step, last, shown);
        assert!(shown <= 100.0);
        last = shown;
    }

    assert_eq!(merger.on_complete(), 100.0);
    assert_eq!(merger.on_update(0, 14), 100.0);
}
