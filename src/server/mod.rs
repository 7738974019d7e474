//! HTTP surface for scans.
//!
//! Routes:
//! - `POST /scan` streams NDJSON progress events for a new scan
//! - `GET /scan/:id` returns the stored scan record
//! - `GET /scan/:id/events` is the SSE side channel
//! - `GET /health`

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::core::{Orchestrator, ProgressHub};
use crate::store::SqliteStore;

/// How often finished side channels are pruned
const HUB_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Build the router with request tracing
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/scan", post(routes::create_scan))
        .route("/scan/:id", get(routes::get_scan))
        .route("/scan/:id/events", get(routes::scan_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drop finished, unwatched side channels
pub fn spawn_hub_cleanup(hub: ProgressHub, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = hub.cleanup().await;
            if removed > 0 {
                debug!(removed, "Pruned finished progress channels");
            }
        }
    })
}

/// Run the HTTP server until Ctrl-C
pub async fn serve(config: &ResolvedConfig) -> Result<()> {
    let store = Arc::new(SqliteStore::open(&config.db_path())?);
    let orchestrator = Orchestrator::from_config(config, store)?;

    let cleanup = spawn_hub_cleanup(orchestrator.hub().clone(), HUB_CLEANUP_INTERVAL);
    let router = build_router(AppState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(bind = %config.bind, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    cleanup.abort();
    Ok(())
}
