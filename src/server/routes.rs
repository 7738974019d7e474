//! Route handlers and the API error mapping.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::{error, warn};
use uuid::Uuid;

use crate::core::validation::resolve_task_types;
use crate::core::{Orchestrator, ScanError};
use crate::domain::{AuditRequest, ProgressUpdate};

use super::AppState;

/// Gateway header carrying the resolved account
pub const ACCOUNT_HEADER: &str = "x-account-id";

/// Gateway header with a comma-separated domain allowlist
pub const ALLOWED_DOMAINS_HEADER: &str = "x-allowed-domains";

/// Gateway header with comma-separated scopes
pub const ALLOWED_SCOPES_HEADER: &str = "x-allowed-scopes";

/// Response header echoing the new scan id
pub const SCAN_ID_HEADER: &str = "x-scan-id";

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub const SCOPE_SCAN_READ: &str = "scan:read";
pub const SCOPE_SCAN_WRITE: &str = "scan:write";

/// Store polling interval for scans not live in this process
pub const STORE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors returned as a single JSON object
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    MissingScope(&'static str),
    NotFound,
    /// Body missing, not JSON, or not a valid scan request
    InvalidBody(String),
    Scan(ScanError),
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        ApiError::Scan(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                format!("Missing {} header", ACCOUNT_HEADER),
            ),
            ApiError::MissingScope(scope) => (
                StatusCode::FORBIDDEN,
                "missing_scope",
                format!("API key lacks the required scope: {}", scope),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "Scan not found".to_string()),
            ApiError::InvalidBody(message) => (StatusCode::BAD_REQUEST, "validation_error", message),
            ApiError::Scan(err) => match err {
                ScanError::Validation(e) => (StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
                ScanError::DomainNotAllowed(domain) => (
                    StatusCode::FORBIDDEN,
                    "domain_not_allowed",
                    format!("Target domain {} is not allowed for this key", domain),
                ),
                ScanError::Admission(denied) => (StatusCode::PAYMENT_REQUIRED, denied.code(), denied.to_string()),
                ScanError::Internal(e) => {
                    error!(error = %e, "Scan request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "Internal server error".to_string(),
                    )
                }
            },
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

/// Pre-resolved caller capability from the auth gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub account_id: String,

    /// `None` means any domain
    pub allowed_domains: Option<Vec<String>>,

    /// Empty means the gateway did not restrict scopes
    pub allowed_scopes: Vec<String>,
}

impl Capability {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let account_id = header_str(headers, ACCOUNT_HEADER)
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::Unauthorized)?
            .to_string();

        let allowed_domains = header_str(headers, ALLOWED_DOMAINS_HEADER).map(split_list);
        let allowed_scopes = header_str(headers, ALLOWED_SCOPES_HEADER)
            .map(split_list)
            .unwrap_or_default();

        Ok(Self {
            account_id,
            allowed_domains,
            allowed_scopes,
        })
    }

    pub fn require_scope(&self, scope: &'static str) -> Result<(), ApiError> {
        if self.allowed_scopes.is_empty() || self.allowed_scopes.iter().any(|s| s == scope) {
            Ok(())
        } else {
            Err(ApiError::MissingScope(scope))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `POST /scan` body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBody {
    pub target_url: String,

    #[serde(default)]
    pub scan_types: Option<Vec<String>>,

    #[serde(default)]
    pub project_id: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tasks": state.orchestrator.registry().task_types(),
    }))
}

/// Validate, admit and stream the scan as NDJSON.
///
/// The run is already spawned when the body starts; a client that hangs
/// up only drops the forwarding side.
pub async fn create_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ScanBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let capability = Capability::from_headers(&headers)?;
    capability.require_scope(SCOPE_SCAN_WRITE)?;

    let Json(body) = body.map_err(|rejection| ApiError::InvalidBody(rejection.body_text()))?;

    let mut request = AuditRequest::new(body.target_url, capability.account_id.clone());
    if let Some(names) = body.scan_types {
        let tasks = resolve_task_types(Some(names.as_slice())).map_err(ScanError::from)?;
        request = request.with_tasks(tasks);
    }
    request.project_id = body.project_id;

    let handle = state
        .orchestrator
        .start(request, capability.allowed_domains.as_deref())
        .await?;

    let lines = UnboundedReceiverStream::new(handle.events).map(|event| event.to_ndjson_line());

    let headers = [
        (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE.to_string()),
        (header::CACHE_CONTROL, "no-cache".to_string()),
        (HeaderName::from_static(SCAN_ID_HEADER), handle.scan_id.to_string()),
    ];

    Ok((StatusCode::OK, headers, Body::from_stream(lines)).into_response())
}

/// Stored record, scoped to the calling account
pub async fn get_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(scan_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let capability = Capability::from_headers(&headers)?;
    capability.require_scope(SCOPE_SCAN_READ)?;

    let record = state
        .orchestrator
        .get_scan(scan_id)
        .await
        .map_err(ScanError::Internal)?
        .filter(|r| r.account_id == capability.account_id)
        .ok_or(ApiError::NotFound)?;

    Ok(Json(record).into_response())
}

type SseStream = BoxStream<'static, Result<Event, Infallible>>;

/// SSE side channel: current snapshot, then updates until terminal.
///
/// Live runs are followed through the progress hub. A scan this process is
/// not running (created elsewhere, or not yet publishing) is followed by
/// polling the store every [`STORE_POLL_INTERVAL`].
pub async fn scan_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(scan_id): Path<Uuid>,
) -> Result<Sse<SseStream>, ApiError> {
    let capability = Capability::from_headers(&headers)?;
    capability.require_scope(SCOPE_SCAN_READ)?;

    let record = state
        .orchestrator
        .get_scan(scan_id)
        .await
        .map_err(ScanError::Internal)?
        .filter(|r| r.account_id == capability.account_id)
        .ok_or(ApiError::NotFound)?;

    let updates: BoxStream<'static, ProgressUpdate> = match state.orchestrator.hub().subscribe(scan_id).await {
        Some((snapshot, rx)) => {
            let live = BroadcastStream::new(rx).filter_map(move |item| async move {
                match item {
                    Ok(update) => Some(update),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(%scan_id, missed, "Side channel subscriber lagged");
                        None
                    }
                }
            });
            stream::once(future::ready(snapshot)).chain(live).boxed()
        }
        None => poll_store(state.orchestrator.clone(), ProgressUpdate::from(&record)),
    };

    let events = updates
        .scan(false, |finished, update| {
            if *finished {
                return future::ready(None);
            }
            *finished = update.is_terminal();
            future::ready(Some(update))
        })
        .filter_map(|update| {
            future::ready(
                Event::default()
                    .event(update.status.as_str())
                    .json_data(&update)
                    .ok()
                    .map(Ok),
            )
        })
        .boxed();

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

struct StorePoll {
    orchestrator: Arc<Orchestrator>,
    first: Option<ProgressUpdate>,
    last: ProgressUpdate,
}

/// Yield `first`, then every change seen in the hub or the store
fn poll_store(orchestrator: Arc<Orchestrator>, first: ProgressUpdate) -> BoxStream<'static, ProgressUpdate> {
    let state = StorePoll {
        orchestrator,
        last: first.clone(),
        first: Some(first),
    };

    stream::unfold(state, |mut state| async move {
        if let Some(first) = state.first.take() {
            return Some((first, state));
        }

        let scan_id = state.last.scan_id;
        while !state.last.is_terminal() {
            tokio::time::sleep(STORE_POLL_INTERVAL).await;

            let next = match state.orchestrator.hub().latest(scan_id).await {
                Some(update) => update,
                None => match state.orchestrator.get_scan(scan_id).await {
                    Ok(Some(record)) => ProgressUpdate::from(&record),
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(%scan_id, error = %e, "Side channel store poll failed");
                        return None;
                    }
                },
            };

            if next != state.last {
                state.last = next.clone();
                return Some((next, state));
            }
        }
        None
    })
    .boxed()
}
