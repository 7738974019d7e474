//! Main orchestrator for scan execution.
//!
//! Request flow:
//! 1. Validate the target and the task list against the registry (no quota
//!    consumed on failure)
//! 2. Enforce the capability domain allowlist
//! 3. Admit against the quota store (single atomic call)
//! 4. Create the pending scan record
//! 5. Spawn the run: dispatch, publish progress, aggregate after the join
//!    barrier, persist, publish the result
//!
//! Everything up to step 4 is reported as a [`ScanError`]. Everything
//! after it is reported only through progress events, and the spawned run
//! continues even if nobody reads them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ResolvedConfig;
use crate::domain::{AuditRequest, ScanRecord, ScanStatus, TaskOutcome, TaskType};
use crate::store::ScanStore;

use super::admission::{AdmissionController, AdmissionDenied, QuotaStore};
use super::aggregator::aggregate;
use super::dispatcher::{DispatchError, Dispatcher};
use super::progress::{InlineReceiver, ProgressHub, ProgressPublisher};
use super::registry::{TaskRegistry, WeightTable, WEIGHTS_V1};
use super::validation::{domain_allowed, TargetPolicy, ValidatedTarget, ValidationError};

/// Request-level failures, all raised before any task runs
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Target domain {0} is not allowed for this key")]
    DomainNotAllowed(String),

    #[error(transparent)]
    Admission(#[from] AdmissionDenied),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// A started scan
pub struct ScanHandle {
    pub scan_id: Uuid,

    /// Inline event stream; dropping it does not stop the run
    pub events: InlineReceiver,

    /// Resolves with the final record once the run is persisted
    pub run: JoinHandle<ScanRecord>,
}

/// Scan orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    policy: TargetPolicy,
    admission: AdmissionController,
    dispatcher: Dispatcher,
    store: Arc<dyn ScanStore>,
    hub: ProgressHub,
    weights: WeightTable,
}

impl Orchestrator {
    pub fn new(registry: TaskRegistry, quota: Arc<dyn QuotaStore>, store: Arc<dyn ScanStore>) -> Self {
        Self {
            policy: TargetPolicy::default(),
            admission: AdmissionController::new(quota),
            dispatcher: Dispatcher::new(Arc::new(registry)),
            store,
            hub: ProgressHub::new(),
            weights: WEIGHTS_V1,
        }
    }

    /// Orchestrator wired to the HTTP scanner backend from configuration
    pub fn from_config<S>(config: &ResolvedConfig, store: Arc<S>) -> anyhow::Result<Self>
    where
        S: QuotaStore + ScanStore + 'static,
    {
        let base_url = config
            .scanner
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Scanner URL not configured (set VANTAGE_SCANNER_URL)"))?;

        let registry = TaskRegistry::http(
            reqwest::Client::new(),
            base_url,
            config.scanner.key.clone(),
            config.scanner.task_timeout,
            &config.scanner.retry,
        );

        let quota: Arc<dyn QuotaStore> = store.clone();
        let scans: Arc<dyn ScanStore> = store;
        Ok(Self::new(registry, quota, scans).with_policy(config.targets.clone()))
    }

    pub fn with_policy(mut self, policy: TargetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_weights(mut self, weights: WeightTable) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_hub(mut self, hub: ProgressHub) -> Self {
        self.hub = hub;
        self
    }

    /// Side-channel hub fed by every run
    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    pub fn registry(&self) -> &TaskRegistry {
        self.dispatcher.registry()
    }

    /// Validate, admit and launch a scan.
    ///
    /// `allowed_domains` is the caller capability's domain allowlist;
    /// `None` means unrestricted.
    #[instrument(skip(self, request, allowed_domains), fields(account_id = %request.account_id))]
    pub async fn start(
        &self,
        request: AuditRequest,
        allowed_domains: Option<&[String]>,
    ) -> Result<ScanHandle, ScanError> {
        let target = self.policy.validate_target(&request.target_url)?;

        if !domain_allowed(&target.domain, allowed_domains) {
            warn!(domain = %target.domain, "Target outside capability allowlist");
            return Err(ScanError::DomainNotAllowed(target.domain));
        }

        let tasks: BTreeSet<TaskType> = match request.enabled_task_types {
            Some(ref tasks) => tasks.clone(),
            None => self.registry().task_types().into_iter().collect(),
        };
        self.dispatcher.plan(&tasks).map_err(|e| match e {
            DispatchError::Validation(e) => e,
            DispatchError::Unregistered(task) => ValidationError::UnregisteredTaskType(task),
        })?;

        self.admission
            .admit(&request.account_id, &target.domain)
            .await?
            .into_result()?;

        let scan_id = Uuid::new_v4();
        let mut record = ScanRecord::pending(
            scan_id,
            request.account_id.clone(),
            target.url.to_string(),
            tasks.len() as u32,
            self.weights.version,
        );
        record.project_id = request.project_id.clone();
        self.store.create_scan(&record).await?;

        info!(%scan_id, domain = %target.domain, tasks = tasks.len(), "Scan admitted");

        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = ProgressPublisher::new(scan_id, tasks.len() as u32, tx, self.hub.clone());
        let run = tokio::spawn(self.clone().execute(record, target, tasks, publisher));

        Ok(ScanHandle {
            scan_id,
            events: rx,
            run,
        })
    }

    /// Run an admitted scan to its terminal event
    #[instrument(skip_all, fields(scan_id = %record.id))]
    async fn execute(
        self,
        mut record: ScanRecord,
        target: ValidatedTarget,
        tasks: BTreeSet<TaskType>,
        mut publisher: ProgressPublisher,
    ) -> ScanRecord {
        let started = Instant::now();
        let scan_id = record.id;

        publisher.started().await;

        // Already planned in `start`
        let mut outcomes = match self.dispatcher.dispatch(&target.url, &tasks) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(error = %e, "Dispatch refused");
                if let Err(store_err) = self.store.fail_scan(scan_id, &e.to_string()).await {
                    error!(error = %store_err, "Failed to persist scan failure");
                }
                publisher.error(e.to_string()).await;

                record.status = ScanStatus::Failed;
                record.error = Some(e.to_string());
                return record;
            }
        };

        if let Err(e) = self.store.mark_running(scan_id).await {
            error!(error = %e, "Failed to mark scan running");
        }
        record.status = ScanStatus::Running;

        let mut settled: BTreeMap<TaskType, TaskOutcome> = BTreeMap::new();
        while let Some((task, outcome)) = outcomes.next().await {
            settled.insert(task, outcome);
            publisher.task_settled(task).await;

            if let Err(e) = self.store.record_progress(scan_id, publisher.completed()).await {
                warn!(error = %e, "Failed to persist progress");
            }
        }

        // Join barrier passed: every task has settled
        let overall_score = aggregate(&settled, &self.weights);
        let succeeded = settled.values().filter(|o| o.is_success()).count();

        if let Err(e) = self.store.complete_scan(scan_id, overall_score, &settled).await {
            error!(error = %e, "Failed to persist scan result");
        }

        info!(
            overall_score,
            succeeded,
            failed = settled.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan completed"
        );

        record.status = ScanStatus::Completed;
        record.overall_score = Some(overall_score);
        record.tasks_completed = publisher.completed();
        record.outcomes = settled.clone();
        record.completed_at = Some(chrono::Utc::now());

        publisher.result(overall_score, settled).await;
        record
    }

    /// Stored record for `scan_id`
    pub async fn get_scan(&self, scan_id: Uuid) -> anyhow::Result<Option<ScanRecord>> {
        self.store.get_scan(scan_id).await
    }
}
