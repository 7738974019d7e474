//! SQLite-backed scan and quota store.
//!
//! All access goes through one connection on the blocking pool. The
//! admission primitive runs inside a `BEGIN IMMEDIATE` transaction, so it
//! also serialises against other processes sharing the database file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::admission::{AdmissionDenied, AdmissionResult, QuotaStore};
use crate::domain::{ScanRecord, ScanStatus, TaskOutcome, TaskType};

use super::{QuotaState, ScanStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quotas (
    account_id   TEXT PRIMARY KEY,
    scans_used   INTEGER NOT NULL DEFAULT 0,
    scans_limit  INTEGER NOT NULL,
    domain_limit INTEGER NOT NULL,
    period       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quota_domains (
    account_id TEXT NOT NULL,
    domain     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (account_id, domain)
);

CREATE TABLE IF NOT EXISTS scans (
    id              TEXT PRIMARY KEY,
    account_id      TEXT NOT NULL,
    project_id      TEXT,
    target_url      TEXT NOT NULL,
    status          TEXT NOT NULL,
    overall_score   INTEGER,
    outcomes_json   TEXT NOT NULL DEFAULT '{}',
    weights_version INTEGER NOT NULL,
    tasks_completed INTEGER NOT NULL DEFAULT 0,
    tasks_total     INTEGER NOT NULL,
    error           TEXT,
    created_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_scans_account ON scans (account_id, created_at);
"#;

/// Billing period key for a point in time
pub fn period_of(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Scan and quota store on a single SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;

        let store = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Opened scan store");
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA).context("Failed to apply schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| anyhow!("Database connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .context("Database task panicked")?
    }

    /// Create or replace an account's plan limits. Usage is kept.
    pub async fn set_plan(&self, account_id: &str, scans_limit: u32, domain_limit: u32) -> Result<()> {
        let account_id = account_id.to_string();
        let period = period_of(Utc::now());

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO quotas (account_id, scans_used, scans_limit, domain_limit, period)
                 VALUES (?1, 0, ?2, ?3, ?4)
                 ON CONFLICT(account_id) DO UPDATE SET
                     scans_limit = excluded.scans_limit,
                     domain_limit = excluded.domain_limit",
                params![account_id, scans_limit, domain_limit, period],
            )
            .with_context(|| format!("Failed to set plan for {}", account_id))?;
            Ok(())
        })
        .await
    }

    /// Current quota state, or `None` if the account has no plan row
    pub async fn quota(&self, account_id: &str) -> Result<Option<QuotaState>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| load_quota(conn, &account_id)).await
    }

    /// Every account with a plan, ordered by id
    pub async fn quotas(&self) -> Result<Vec<QuotaState>> {
        self.with_conn(|conn| {
            let ids: Vec<String> = {
                let mut stmt = conn.prepare("SELECT account_id FROM quotas ORDER BY account_id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut states = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(state) = load_quota(conn, &id)? {
                    states.push(state);
                }
            }
            Ok(states)
        })
        .await
    }

    /// Admission against an explicit billing period
    pub async fn try_admit_in_period(&self, account_id: &str, domain: &str, period: &str) -> Result<AdmissionResult> {
        let account_id = account_id.to_string();
        let domain = domain.to_string();
        let period = period.to_string();

        self.with_conn(move |conn| admit_tx(conn, &account_id, &domain, &period))
            .await
    }
}

/// Check-and-consume in one immediate transaction. Denials roll back.
fn admit_tx(conn: &mut Connection, account_id: &str, domain: &str, period: &str) -> Result<AdmissionResult> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin admission transaction")?;

    let row: Option<(u32, u32, u32, String)> = tx
        .query_row(
            "SELECT scans_used, scans_limit, domain_limit, period FROM quotas WHERE account_id = ?1",
            params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .context("Failed to read quota")?;

    let Some((scans_used, scans_limit, domain_limit, stored_period)) = row else {
        return Ok(AdmissionResult::denied(AdmissionDenied::PlanRequired));
    };

    if scans_limit == 0 {
        return Ok(AdmissionResult::denied(AdmissionDenied::PlanRequired));
    }

    let used = if stored_period == period { scans_used } else { 0 };

    let known: bool = tx
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM quota_domains WHERE account_id = ?1 AND domain = ?2)",
            params![account_id, domain],
            |row| row.get(0),
        )
        .context("Failed to read registered domains")?;

    if !known {
        let registered: u32 = tx
            .query_row(
                "SELECT COUNT(*) FROM quota_domains WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .context("Failed to count registered domains")?;

        if registered >= domain_limit {
            return Ok(AdmissionResult::denied(AdmissionDenied::DomainLimitReached));
        }
    }

    if used >= scans_limit {
        return Ok(AdmissionResult::denied(AdmissionDenied::ScanLimitReached));
    }

    if !known {
        tx.execute(
            "INSERT INTO quota_domains (account_id, domain, created_at) VALUES (?1, ?2, ?3)",
            params![account_id, domain, Utc::now().to_rfc3339()],
        )
        .context("Failed to register domain")?;
    }

    tx.execute(
        "UPDATE quotas SET scans_used = ?2, period = ?3 WHERE account_id = ?1",
        params![account_id, used + 1, period],
    )
    .context("Failed to increment scan usage")?;

    tx.commit().context("Failed to commit admission")?;
    debug!(%account_id, %domain, used = used + 1, limit = scans_limit, "Quota consumed");

    Ok(AdmissionResult::allowed())
}

fn load_quota(conn: &Connection, account_id: &str) -> Result<Option<QuotaState>> {
    let row: Option<(u32, u32, u32, String)> = conn
        .query_row(
            "SELECT scans_used, scans_limit, domain_limit, period FROM quotas WHERE account_id = ?1",
            params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .context("Failed to read quota")?;

    let Some((scans_used, scans_limit, domain_limit, period)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare("SELECT domain FROM quota_domains WHERE account_id = ?1 ORDER BY domain")?;
    let domains = stmt
        .query_map(params![account_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    // Usage from a past month reads as zero until the next admission resets it
    let scans_used = if period == period_of(Utc::now()) { scans_used } else { 0 };

    Ok(Some(QuotaState {
        account_id: account_id.to_string(),
        scans_used,
        scans_limit,
        domain_limit,
        period,
        domains,
    }))
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn try_admit(&self, account_id: &str, domain: &str) -> Result<AdmissionResult> {
        self.try_admit_in_period(account_id, domain, &period_of(Utc::now()))
            .await
    }
}

/// Raw column values of one `scans` row
struct ScanRow {
    id: String,
    account_id: String,
    project_id: Option<String>,
    target_url: String,
    status: String,
    overall_score: Option<u8>,
    outcomes_json: String,
    weights_version: u32,
    tasks_completed: u32,
    tasks_total: u32,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl ScanRow {
    fn into_record(self) -> Result<ScanRecord> {
        let outcomes: BTreeMap<TaskType, TaskOutcome> = serde_json::from_str(&self.outcomes_json)
            .with_context(|| format!("Corrupt outcomes for scan {}", self.id))?;

        Ok(ScanRecord {
            id: Uuid::parse_str(&self.id).with_context(|| format!("Invalid scan id: {}", self.id))?,
            status: ScanStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("Unknown scan status: {}", self.status))?,
            account_id: self.account_id,
            project_id: self.project_id,
            target_url: self.target_url,
            overall_score: self.overall_score,
            outcomes,
            weights_version: self.weights_version,
            tasks_completed: self.tasks_completed,
            tasks_total: self.tasks_total,
            created_at: parse_time(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            error: self.error,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}

#[async_trait]
impl ScanStore for SqliteStore {
    async fn create_scan(&self, record: &ScanRecord) -> Result<()> {
        let record = record.clone();
        let outcomes_json = serde_json::to_string(&record.outcomes).context("Failed to serialize outcomes")?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scans (id, account_id, project_id, target_url, status, overall_score, outcomes_json,
                                    weights_version, tasks_completed, tasks_total, error, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.id.to_string(),
                    record.account_id,
                    record.project_id,
                    record.target_url,
                    record.status.as_str(),
                    record.overall_score,
                    outcomes_json,
                    record.weights_version,
                    record.tasks_completed,
                    record.tasks_total,
                    record.error,
                    record.created_at.to_rfc3339(),
                    record.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .with_context(|| format!("Failed to insert scan {}", record.id))?;
            Ok(())
        })
        .await
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE scans SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                    params![id.to_string()],
                )
                .with_context(|| format!("Failed to mark scan {} running", id))?;
            if updated == 0 {
                anyhow::bail!("Scan {} is not pending", id);
            }
            Ok(())
        })
        .await
    }

    async fn record_progress(&self, id: Uuid, completed: u32) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scans SET tasks_completed = MIN(MAX(tasks_completed, ?2), tasks_total)
                 WHERE id = ?1 AND status = 'running'",
                params![id.to_string(), completed],
            )
            .with_context(|| format!("Failed to record progress for scan {}", id))?;
            Ok(())
        })
        .await
    }

    async fn complete_scan(
        &self,
        id: Uuid,
        overall_score: u8,
        outcomes: &BTreeMap<TaskType, TaskOutcome>,
    ) -> Result<()> {
        let outcomes_json = serde_json::to_string(outcomes).context("Failed to serialize outcomes")?;

        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE scans SET status = 'completed', overall_score = ?2, outcomes_json = ?3,
                            tasks_completed = tasks_total, completed_at = ?4
                     WHERE id = ?1 AND status IN ('pending', 'running')",
                    params![id.to_string(), overall_score, outcomes_json, Utc::now().to_rfc3339()],
                )
                .with_context(|| format!("Failed to complete scan {}", id))?;
            if updated == 0 {
                anyhow::bail!("Scan {} is missing or already terminal", id);
            }
            Ok(())
        })
        .await
    }

    async fn fail_scan(&self, id: Uuid, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE scans SET status = 'failed', error = ?2, completed_at = ?3
                     WHERE id = ?1 AND status IN ('pending', 'running')",
                    params![id.to_string(), reason, Utc::now().to_rfc3339()],
                )
                .with_context(|| format!("Failed to mark scan {} failed", id))?;
            if updated == 0 {
                anyhow::bail!("Scan {} is missing or already terminal", id);
            }
            Ok(())
        })
        .await
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<ScanRecord>> {
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, account_id, project_id, target_url, status, overall_score, outcomes_json,
                            weights_version, tasks_completed, tasks_total, error, created_at, completed_at
                     FROM scans WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok(ScanRow {
                            id: row.get(0)?,
                            account_id: row.get(1)?,
                            project_id: row.get(2)?,
                            target_url: row.get(3)?,
                            status: row.get(4)?,
                            overall_score: row.get(5)?,
                            outcomes_json: row.get(6)?,
                            weights_version: row.get(7)?,
                            tasks_completed: row.get(8)?,
                            tasks_total: row.get(9)?,
                            error: row.get(10)?,
                            created_at: row.get(11)?,
                            completed_at: row.get(12)?,
                        })
                    },
                )
                .optional()
                .with_context(|| format!("Failed to load scan {}", id))
            })
            .await?;

        row.map(ScanRow::into_record).transpose()
    }
}
