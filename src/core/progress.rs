//! Progress publishing for one scan run and the side-channel hub.
//!
//! The publisher enforces the event state machine:
//! `NotStarted -> Started -> Progress* -> Result | Error`.
//! Out-of-order calls are dropped with a warning instead of being sent.
//!
//! Each accepted event goes to two places:
//! - the inline channel feeding the request's own NDJSON body
//! - the [`ProgressHub`], keyed by scan id, for late subscribers
//!
//! Both are fed from the same counters, so they never disagree about
//! `completed`/`total`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{ProgressEvent, ProgressUpdate, ScanStatus, TaskOutcome, TaskType};

/// Default buffered updates per scan channel
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Sender half of the inline event stream
pub type InlineSender = mpsc::UnboundedSender<ProgressEvent>;

/// Receiver half of the inline event stream
pub type InlineReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    Terminal,
}

/// Emits the events of exactly one run
pub struct ProgressPublisher {
    scan_id: Uuid,
    total: u32,
    completed: u32,
    phase: Phase,
    inline: InlineSender,
    inline_open: bool,
    hub: ProgressHub,
}

impl ProgressPublisher {
    pub fn new(scan_id: Uuid, total: u32, inline: InlineSender, hub: ProgressHub) -> Self {
        Self {
            scan_id,
            total,
            completed: 0,
            phase: Phase::NotStarted,
            inline,
            inline_open: true,
            hub,
        }
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Terminal
    }

    /// Emit `Started`. Only valid once, before anything else.
    pub async fn started(&mut self) -> bool {
        if self.phase != Phase::NotStarted {
            warn!(scan_id = %self.scan_id, "Ignoring duplicate started event");
            return false;
        }
        self.phase = Phase::Started;

        self.emit(ProgressEvent::Started {
            scan_id: self.scan_id,
            total_tasks: self.total,
        });
        self.hub.publish(self.snapshot(ScanStatus::Running, None)).await;
        true
    }

    /// Record one settled task and emit `Progress`
    pub async fn task_settled(&mut self, task: TaskType) -> bool {
        if self.phase != Phase::Started {
            warn!(scan_id = %self.scan_id, task = %task, "Ignoring progress outside a running scan");
            return false;
        }
        if self.completed >= self.total {
            warn!(scan_id = %self.scan_id, task = %task, "Ignoring progress beyond total");
            return false;
        }
        self.completed += 1;

        self.emit(ProgressEvent::Progress {
            completed: self.completed,
            total: self.total,
            task,
        });
        self.hub.publish(self.snapshot(ScanStatus::Running, None)).await;
        true
    }

    /// Emit the terminal `Result`
    pub async fn result(&mut self, overall_score: u8, outcomes: BTreeMap<TaskType, TaskOutcome>) -> bool {
        if self.phase != Phase::Started {
            warn!(scan_id = %self.scan_id, "Ignoring result outside a running scan");
            return false;
        }
        self.phase = Phase::Terminal;

        self.emit(ProgressEvent::Result {
            overall_score,
            outcomes,
        });
        self.hub
            .publish(self.snapshot(ScanStatus::Completed, Some(overall_score)))
            .await;
        true
    }

    /// Emit the terminal `Error`
    pub async fn error(&mut self, message: impl Into<String>) -> bool {
        if self.phase != Phase::Started {
            warn!(scan_id = %self.scan_id, "Ignoring error outside a running scan");
            return false;
        }
        self.phase = Phase::Terminal;

        self.emit(ProgressEvent::Error {
            message: message.into(),
        });
        self.hub.publish(self.snapshot(ScanStatus::Failed, None)).await;
        true
    }

    fn snapshot(&self, status: ScanStatus, overall_score: Option<u8>) -> ProgressUpdate {
        ProgressUpdate {
            scan_id: self.scan_id,
            completed: self.completed,
            total: self.total,
            status,
            overall_score,
        }
    }

    /// Send inline; a gone receiver means the client disconnected
    fn emit(&mut self, event: ProgressEvent) {
        if !self.inline_open {
            return;
        }
        if self.inline.send(event).is_err() {
            debug!(scan_id = %self.scan_id, "Inline stream closed, continuing without it");
            self.inline_open = false;
        }
    }
}

struct ScanChannel {
    tx: broadcast::Sender<ProgressUpdate>,
    latest: ProgressUpdate,
}

/// In-process pub/sub keyed by scan id.
///
/// Keeps the latest snapshot per scan so a subscriber that attaches late
/// starts from the current counters.
#[derive(Clone)]
pub struct ProgressHub {
    channels: Arc<RwLock<HashMap<Uuid, ScanChannel>>>,
    capacity: usize,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Store the snapshot and fan it out. Creates the channel on first use.
    pub async fn publish(&self, update: ProgressUpdate) {
        let mut channels = self.channels.write().await;
        let channel = channels.entry(update.scan_id).or_insert_with(|| ScanChannel {
            tx: broadcast::channel(self.capacity).0,
            latest: update.clone(),
        });
        channel.latest = update.clone();
        // Ignore send errors (no active receivers)
        let _ = channel.tx.send(update);
    }

    /// Current snapshot plus a receiver for everything after it
    pub async fn subscribe(&self, scan_id: Uuid) -> Option<(ProgressUpdate, broadcast::Receiver<ProgressUpdate>)> {
        let channels = self.channels.read().await;
        channels
            .get(&scan_id)
            .map(|channel| (channel.latest.clone(), channel.tx.subscribe()))
    }

    pub async fn latest(&self, scan_id: Uuid) -> Option<ProgressUpdate> {
        self.channels
            .read()
            .await
            .get(&scan_id)
            .map(|channel| channel.latest.clone())
    }

    /// Drop finished scans nobody is listening to. Returns how many went.
    pub async fn cleanup(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, channel| !channel.latest.is_terminal() || channel.tx.receiver_count() > 0);
        before - channels.len()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(total: u32) -> (ProgressPublisher, InlineReceiver, ProgressHub) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = ProgressHub::new();
        (ProgressPublisher::new(Uuid::new_v4(), total, tx, hub.clone()), rx, hub)
    }

    fn drain(rx: &mut InlineReceiver) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_events_before_start_are_dropped() {
        let (mut publisher, mut rx, _hub) = publisher(2);

        assert!(!publisher.task_settled(TaskType::Ssl).await);
        assert!(!publisher.result(50, BTreeMap::new()).await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_single_terminal_event() {
        let (mut publisher, mut rx, _hub) = publisher(1);

        assert!(publisher.started().await);
        assert!(!publisher.started().await);
        assert!(publisher.task_settled(TaskType::Ssl).await);
        assert!(!publisher.task_settled(TaskType::Dns).await);
        assert!(publisher.result(90, BTreeMap::new()).await);
        assert!(!publisher.error("late").await);
        assert!(!publisher.task_settled(TaskType::Dns).await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProgressEvent::Started { total_tasks: 1, .. }));
        assert!(matches!(events[1], ProgressEvent::Progress { completed: 1, total: 1, .. }));
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_disconnected_inline_still_feeds_hub() {
        let (mut publisher, rx, hub) = publisher(2);
        drop(rx);

        publisher.started().await;
        publisher.task_settled(TaskType::Cors).await;

        let snapshot = hub.latest(publisher.scan_id).await.unwrap();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.status, ScanStatus::Running);
    }

    #[tokio::test]
    async fn test_subscribe_gets_snapshot_then_updates() {
        let (mut publisher, _rx, hub) = publisher(2);
        publisher.started().await;

        let (snapshot, mut updates) = hub.subscribe(publisher.scan_id).await.unwrap();
        assert_eq!(snapshot.completed, 0);

        publisher.task_settled(TaskType::Xss).await;
        let update = updates.recv().await.unwrap();
        assert_eq!(update.completed, 1);

        assert!(hub.subscribe(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_running_and_watched_scans() {
        let hub = ProgressHub::new();
        let running = Uuid::new_v4();
        let finished = Uuid::new_v4();
        let watched = Uuid::new_v4();

        for (id, status) in [
            (running, ScanStatus::Running),
            (finished, ScanStatus::Completed),
            (watched, ScanStatus::Completed),
        ] {
            hub.publish(ProgressUpdate {
                scan_id: id,
                completed: 1,
                total: 1,
                status,
                overall_score: None,
            })
            .await;
        }
        let _watcher = hub.subscribe(watched).await.unwrap();

        assert_eq!(hub.cleanup().await, 1);
        assert!(hub.latest(running).await.is_some());
        assert!(hub.latest(watched).await.is_some());
        assert!(hub.latest(finished).await.is_none());
    }
}
