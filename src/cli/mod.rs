//! Command-line interface for vantage.
//!
//! Provides commands for serving the HTTP API, running scans locally or
//! against a server, checking status and managing account quotas.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use uuid::Uuid;

use crate::client::{ProgressMerger, ScanClient, UpdateStream};
use crate::config;
use crate::core::validation::resolve_task_types;
use crate::core::Orchestrator;
use crate::domain::{AuditRequest, ProgressEvent, ProgressUpdate, ScanRecord, TaskOutcome};
use crate::store::{QuotaState, SqliteStore};

/// Account used for local runs when none is given
pub const LOCAL_ACCOUNT: &str = "local";

/// How often the merged percentage is redrawn
const RENDER_INTERVAL: Duration = Duration::from_millis(250);

/// vantage - Concurrent website audit orchestrator
#[derive(Parser, Debug)]
#[command(name = "vantage")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run a scan in-process and print NDJSON events to stdout
    Scan {
        /// Target URL
        url: String,

        /// Task types to run (comma-separated, default all)
        #[arg(short, long, value_delimiter = ',')]
        types: Option<Vec<String>>,

        /// Account charged for the scan
        #[arg(short, long, default_value = LOCAL_ACCOUNT)]
        account: String,
    },

    /// Submit a scan to a running server and follow its progress
    Submit {
        /// Target URL
        url: String,

        /// Server base URL
        #[arg(short, long, env = "VANTAGE_SERVER", default_value = "http://127.0.0.1:9000")]
        server: String,

        /// Account sent as x-account-id
        #[arg(short, long, default_value = LOCAL_ACCOUNT)]
        account: String,

        /// Task types to run (comma-separated, default all)
        #[arg(short, long, value_delimiter = ',')]
        types: Option<Vec<String>>,

        /// Read only the first line, then follow the SSE side channel
        #[arg(long)]
        side_channel: bool,
    },

    /// Show a stored scan
    Status {
        /// Scan ID (UUID)
        scan_id: String,

        /// Query a server instead of the local database
        #[arg(short, long)]
        server: Option<String>,

        /// Account sent as x-account-id when querying a server
        #[arg(short, long, default_value = LOCAL_ACCOUNT)]
        account: String,

        /// Follow progress until the scan finishes (requires --server)
        #[arg(short, long, requires = "server")]
        follow: bool,
    },

    /// Manage account quotas
    Quota {
        #[command(subcommand)]
        command: QuotaCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum QuotaCommands {
    /// Set an account's plan limits (usage is kept)
    Set {
        account: String,

        /// Scans allowed per calendar month
        #[arg(long)]
        scans: u32,

        /// Distinct domains allowed per calendar month
        #[arg(long)]
        domains: u32,
    },

    /// Show quota usage for one or all accounts
    Show { account: Option<String> },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { bind } => serve(bind).await,
            Commands::Scan { url, types, account } => run_local_scan(&url, types, &account).await,
            Commands::Submit {
                url,
                server,
                account,
                types,
                side_channel,
            } => {
                if side_channel {
                    submit_and_follow(&url, &server, &account, types).await
                } else {
                    submit_scan(&url, &server, &account, types).await
                }
            }
            Commands::Status {
                scan_id,
                server,
                account,
                follow,
            } => match (server, follow) {
                (Some(server), true) => follow_status(&scan_id, &server, &account).await,
                (server, _) => show_status(&scan_id, server.as_deref(), &account).await,
            },
            Commands::Quota { command } => match command {
                QuotaCommands::Set {
                    account,
                    scans,
                    domains,
                } => set_quota(&account, scans, domains).await,
                QuotaCommands::Show { account } => show_quota(account.as_deref()).await,
            },
            Commands::Config => show_config(),
        }
    }
}

fn open_store() -> Result<SqliteStore> {
    let path = config::db_path()?;
    SqliteStore::open(&path)
}

/// Start the HTTP server
async fn serve(bind: Option<String>) -> Result<()> {
    let mut cfg = config::config()?.clone();
    if let Some(bind) = bind {
        cfg.bind = bind;
    }
    crate::server::serve(&cfg).await
}

/// Run a scan in this process, streaming events as NDJSON
async fn run_local_scan(url: &str, types: Option<Vec<String>>, account: &str) -> Result<()> {
    let cfg = config::config()?;
    let store = Arc::new(open_store()?);
    let orchestrator = Orchestrator::from_config(cfg, store)?;

    let mut request = AuditRequest::new(url, account);
    if let Some(names) = types {
        request = request.with_tasks(resolve_task_types(Some(names.as_slice()))?);
    }

    let mut handle = orchestrator.start(request, None).await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = handle.events.recv().await {
        stdout.write_all(event.to_ndjson_line()?.as_bytes())?;
        stdout.flush()?;
    }

    let record = handle.run.await.context("Scan task panicked")?;
    eprintln!("\n[Scan {} {}]", record.id, record.status.as_str());
    Ok(())
}

/// Submit to a server and render the merged percentage on stderr
async fn submit_scan(url: &str, server: &str, account: &str, types: Option<Vec<String>>) -> Result<()> {
    let settings = config::config()?.progress;
    let client = ScanClient::new(server, account);
    let mut events = client.submit(url, types).await?;

    let mut merger = ProgressMerger::from_settings(&settings, Instant::now());
    let mut ticker = tokio::time::interval(RENDER_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                render(merger.tick(Instant::now()));
            }
            next = events.next() => {
                let Some(event) = next else {
                    anyhow::bail!("Event stream ended before a result");
                };
                match event? {
                    ProgressEvent::Started { scan_id, total_tasks } => {
                        eprintln!("Scan {} started ({} tasks)", scan_id, total_tasks);
                    }
                    ProgressEvent::Progress { completed, total, task } => {
                        render(merger.on_update(completed, total));
                        tracing::debug!(%task, completed, total, "Task settled");
                    }
                    ProgressEvent::Result { overall_score, outcomes } => {
                        render(merger.on_complete());
                        eprintln!();
                        println!("Overall score: {}", overall_score);
                        for (task, outcome) in &outcomes {
                            println!("  {:<18} {}", task.as_str(), describe_outcome(outcome));
                        }
                        return Ok(());
                    }
                    ProgressEvent::Error { message } => {
                        eprintln!();
                        anyhow::bail!("Scan failed: {}", message);
                    }
                }
            }
        }
    }
}

/// Submit, keep only the scan id from the inline stream, then follow the
/// side channel
async fn submit_and_follow(url: &str, server: &str, account: &str, types: Option<Vec<String>>) -> Result<()> {
    let client = ScanClient::new(server, account);
    let mut events = client.submit(url, types).await?;

    let scan_id = match events.next().await {
        Some(Ok(ProgressEvent::Started { scan_id, total_tasks })) => {
            eprintln!("Scan {} started ({} tasks)", scan_id, total_tasks);
            scan_id
        }
        Some(Ok(other)) => anyhow::bail!("Expected a started event, got {:?}", other),
        Some(Err(e)) => return Err(e),
        None => anyhow::bail!("Event stream ended before the scan started"),
    };
    // The run continues server-side without an inline reader
    drop(events);

    follow_to_end(&client, scan_id).await
}

/// Follow a server-side scan until it finishes
async fn follow_status(scan_id_str: &str, server: &str, account: &str) -> Result<()> {
    let scan_id = Uuid::parse_str(scan_id_str).with_context(|| format!("Invalid scan ID: {}", scan_id_str))?;
    follow_to_end(&ScanClient::new(server, account), scan_id).await
}

async fn follow_to_end(client: &ScanClient, scan_id: Uuid) -> Result<()> {
    let settings = config::config()?.progress;
    let mut merger = ProgressMerger::from_settings(&settings, Instant::now());

    let updates = client.follow(scan_id).await?;
    follow_progress(updates, &mut merger).await?;

    let record = client
        .get_scan(scan_id)
        .await?
        .with_context(|| format!("Scan not found: {}", scan_id))?;
    print_record(&record);
    Ok(())
}

/// Drive `merger` from side-channel updates, redrawing between them
async fn follow_progress(mut updates: UpdateStream, merger: &mut ProgressMerger) -> Result<ProgressUpdate> {
    let mut ticker = tokio::time::interval(RENDER_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                render(merger.tick(Instant::now()));
            }
            next = updates.next() => {
                let Some(update) = next else {
                    anyhow::bail!("Side channel closed before the scan finished");
                };
                let update = update?;
                if update.is_terminal() {
                    render(merger.on_complete());
                    eprintln!();
                    return Ok(update);
                }
                render(merger.on_update(update.completed, update.total));
            }
        }
    }
}

fn render(percent: f64) {
    eprint!("\rProgress: {:>3}%", percent.floor() as u32);
    let _ = std::io::stderr().flush();
}

fn describe_outcome(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Success { score, findings } => format!("{:>3}  ({} findings)", score, findings.len()),
        TaskOutcome::Failure { reason } => format!("  -  failed: {}", reason),
    }
}

/// Show a stored scan
async fn show_status(scan_id_str: &str, server: Option<&str>, account: &str) -> Result<()> {
    let scan_id = Uuid::parse_str(scan_id_str).with_context(|| format!("Invalid scan ID: {}", scan_id_str))?;

    let record = match server {
        Some(server) => ScanClient::new(server, account).get_scan(scan_id).await?,
        None => {
            use crate::store::ScanStore;
            open_store()?.get_scan(scan_id).await?
        }
    };

    let Some(record) = record else {
        anyhow::bail!("Scan not found: {}", scan_id);
    };
    print_record(&record);
    Ok(())
}

fn print_record(record: &ScanRecord) {
    println!("Scan ID: {}", record.id);
    println!("Account: {}", record.account_id);
    println!("Target: {}", record.target_url);
    println!("Status: {}", record.status.as_str());
    println!("Progress: {}/{}", record.tasks_completed, record.tasks_total);
    if let Some(score) = record.overall_score {
        println!("Overall score: {} (weights v{})", score, record.weights_version);
    }
    if let Some(ref error) = record.error {
        println!("Error: {}", error);
    }
    println!("Created: {}", record.created_at);
    if let Some(completed) = record.completed_at {
        println!("Completed: {}", completed);
    }
    if !record.outcomes.is_empty() {
        println!("\nOutcomes:");
        for (task, outcome) in &record.outcomes {
            println!("  {:<18} {}", task.as_str(), describe_outcome(outcome));
        }
    }
}

async fn set_quota(account: &str, scans: u32, domains: u32) -> Result<()> {
    let store = open_store()?;
    store.set_plan(account, scans, domains).await?;

    if let Some(state) = store.quota(account).await? {
        print_quota_header();
        print_quota(&state);
    }
    Ok(())
}

async fn show_quota(account: Option<&str>) -> Result<()> {
    let store = open_store()?;

    let states = match account {
        Some(account) => store.quota(account).await?.into_iter().collect(),
        None => store.quotas().await?,
    };

    if states.is_empty() {
        println!("No quotas found");
        return Ok(());
    }

    print_quota_header();
    for state in &states {
        print_quota(state);
    }
    Ok(())
}

fn print_quota_header() {
    println!("{:<24} {:<9} {:<12} {:<12}", "ACCOUNT", "PERIOD", "SCANS", "DOMAINS");
    println!("{}", "-".repeat(60));
}

fn print_quota(state: &QuotaState) {
    println!(
        "{:<24} {:<9} {:<12} {:<12}",
        state.account_id,
        state.period,
        format!("{}/{}", state.scans_used, state.scans_limit),
        format!("{}/{}", state.domains.len(), state.domain_limit),
    );
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Vantage Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.db_path().display());
    println!();
    println!("Server:");
    println!("  Bind: {}", cfg.bind);
    println!();
    println!("Scanner:");
    println!("  URL:          {}", cfg.scanner.url.as_deref().unwrap_or("(not set)"));
    println!("  Key:          {}", if cfg.scanner.key.is_some() { "(set)" } else { "(not set)" });
    println!("  Task timeout: {}s", cfg.scanner.task_timeout.as_secs());
    println!(
        "  Retry:        {} attempts, {}ms initial, {}ms max, x{}",
        cfg.scanner.retry.max_attempts,
        cfg.scanner.retry.initial_delay_ms,
        cfg.scanner.retry.max_delay_ms,
        cfg.scanner.retry.backoff_multiplier
    );
    println!();
    println!("Progress simulation:");
    println!("  Ramp: {}s", cfg.progress.ramp.as_secs());
    println!("  Cap:  {}%", cfg.progress.cap);
    println!();
    println!("Targets:");
    println!("  Max URL length: {}", cfg.targets.max_url_len);
    if cfg.targets.host_denylist.is_empty() {
        println!("  Host denylist:  (none)");
    } else {
        for pattern in &cfg.targets.host_denylist {
            println!("  Host denylist:  {}", pattern);
        }
    }

    Ok(())
}
