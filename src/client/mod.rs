//! Client for a running vantage server.
//!
//! [`ScanClient::submit`] reads the inline NDJSON stream of `POST /scan`
//! as it arrives. [`ScanClient::follow`] reads the SSE side channel for a
//! scan id, seeded with a fetch of the stored record so updates published
//! before the subscription are not lost. [`ProgressMerger`] turns either
//! into a non-decreasing percentage for display.

pub mod merge;
pub mod ndjson;
pub mod sse;

pub use merge::ProgressMerger;
pub use ndjson::NdjsonDecoder;
pub use sse::{SseDecoder, SseFrame};

use std::collections::VecDeque;

use anyhow::{anyhow, Context, Result};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{ProgressEvent, ProgressUpdate, ScanRecord};
use crate::server::routes::{ACCOUNT_HEADER, ALLOWED_DOMAINS_HEADER, ALLOWED_SCOPES_HEADER};

/// Decoded inline events; ends after the terminal event or on a stream error
pub type EventStream = BoxStream<'static, Result<ProgressEvent>>;

/// Decoded side-channel updates; ends after the terminal update
pub type UpdateStream = BoxStream<'static, Result<ProgressUpdate>>;

/// HTTP client carrying a gateway-style capability
#[derive(Debug, Clone)]
pub struct ScanClient {
    base_url: String,
    account_id: String,
    allowed_domains: Option<Vec<String>>,
    scopes: Option<Vec<String>>,
    http: reqwest::Client,
}

impl ScanClient {
    pub fn new(base_url: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            allowed_domains: None,
            scopes: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = Some(domains);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(ACCOUNT_HEADER, &self.account_id);

        if let Some(ref domains) = self.allowed_domains {
            request = request.header(ALLOWED_DOMAINS_HEADER, domains.join(","));
        }
        if let Some(ref scopes) = self.scopes {
            request = request.header(ALLOWED_SCOPES_HEADER, scopes.join(","));
        }
        request
    }

    /// Start a scan and stream its inline events
    pub async fn submit(&self, target_url: &str, scan_types: Option<Vec<String>>) -> Result<EventStream> {
        let mut body = json!({ "targetUrl": target_url });
        if let Some(types) = scan_types {
            body["scanTypes"] = json!(types);
        }

        let response = self
            .request(reqwest::Method::POST, "/scan")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Scan rejected ({}): {}", status, error_message(&text));
        }

        debug!(%status, "Scan accepted, reading event stream");
        Ok(decode_events(Box::pin(response.bytes_stream())))
    }

    /// Fetch the stored record, `None` if unknown to this account
    pub async fn get_scan(&self, scan_id: Uuid) -> Result<Option<ScanRecord>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/scan/{}", scan_id))
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Status request failed ({}): {}", status, error_message(&text));
        }

        let record = response.json().await.context("Failed to decode scan record")?;
        Ok(Some(record))
    }

    /// Subscribe to the SSE side channel for `scan_id`
    pub async fn subscribe(&self, scan_id: Uuid) -> Result<UpdateStream> {
        let response = self
            .request(reqwest::Method::GET, &format!("/scan/{}/events", scan_id))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Subscribe failed ({}): {}", status, error_message(&text));
        }

        debug!(%scan_id, "Following side channel");
        Ok(decode_updates(Box::pin(response.bytes_stream())))
    }

    /// Stored snapshot followed by side-channel updates until terminal.
    ///
    /// Subscribes first and fetches second, so nothing between the two is
    /// missed; a snapshot that is already terminal ends the stream.
    pub async fn follow(&self, scan_id: Uuid) -> Result<UpdateStream> {
        let live = self.subscribe(scan_id).await?;
        let record = self
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| anyhow!("Scan not found: {}", scan_id))?;

        let snapshot = ProgressUpdate::from(&record);
        let first = stream::once(future::ready(Ok(snapshot.clone())));
        if snapshot.is_terminal() {
            return Ok(first.boxed());
        }
        Ok(first.chain(live).boxed())
    }
}

/// Pull the `error` field out of a JSON error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Incremental body decoder driven by [`decode_chunks`]
trait Frames<T>: Send + 'static {
    fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<T>>;

    fn finish_chunks(&mut self) -> Result<Option<T>>;
}

impl<T: DeserializeOwned> Frames<T> for NdjsonDecoder {
    fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<T>> {
        self.push(chunk)
    }

    fn finish_chunks(&mut self) -> Result<Option<T>> {
        self.finish()
    }
}

impl Frames<SseFrame> for SseDecoder {
    fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.push(chunk)
    }

    fn finish_chunks(&mut self) -> Result<Option<SseFrame>> {
        Ok(None)
    }
}

struct DecodeState<S, D, T> {
    bytes: S,
    decoder: D,
    ready: VecDeque<T>,
    done: bool,
}

/// Turn a chunked byte stream into decoded events
pub fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    decode_chunks(bytes, NdjsonDecoder::new())
}

/// Turn a chunked SSE body into side-channel updates
pub fn decode_updates<S, B, E>(bytes: S) -> UpdateStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    decode_chunks::<_, _, _, _, SseFrame>(bytes, SseDecoder::new())
        .map(|frame| frame.and_then(|f| f.json::<ProgressUpdate>()))
        .boxed()
}

fn decode_chunks<S, B, E, D, T>(bytes: S, decoder: D) -> BoxStream<'static, Result<T>>
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
    D: Frames<T>,
    T: Send + 'static,
{
    let state = DecodeState {
        bytes,
        decoder,
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((Ok(item), state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => match state.decoder.push_chunk(chunk.as_ref()) {
                    Ok(items) => state.ready.extend(items),
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(anyhow::Error::new(e).context("Event stream interrupted")), state));
                }
                None => {
                    state.done = true;
                    match state.decoder.finish_chunks() {
                        Ok(Some(item)) => state.ready.push_back(item),
                        Ok(None) => {}
                        Err(e) => return Some((Err(e), state)),
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;

    #[tokio::test]
    async fn test_decode_events_across_chunks() {
        let scan_id = Uuid::new_v4();
        let text = format!(
            "{}{}",
            ProgressEvent::Started {
                scan_id,
                total_tasks: 1
            }
            .to_ndjson_line()
            .unwrap(),
            ProgressEvent::Progress {
                completed: 1,
                total: 1,
                task: TaskType::Ssl
            }
            .to_ndjson_line()
            .unwrap()
        );

        let bytes = text.into_bytes();
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();

        let events: Vec<ProgressEvent> = decode_events(stream::iter(chunks))
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ProgressEvent::Started {
                scan_id,
                total_tasks: 1
            }
        );
    }

    #[tokio::test]
    async fn test_decode_updates_skips_keep_alives() {
        let scan_id = Uuid::new_v4();
        let running = ProgressUpdate {
            scan_id,
            completed: 1,
            total: 2,
            status: crate::domain::ScanStatus::Running,
            overall_score: None,
        };
        let text = format!(
            ":\n\nevent: running\ndata: {}\n\n",
            serde_json::to_string(&running).unwrap()
        );

        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            text.as_bytes().chunks(9).map(|c| Ok(c.to_vec())).collect();
        let updates: Vec<ProgressUpdate> = decode_updates(stream::iter(chunks))
            .map(|u| u.unwrap())
            .collect()
            .await;

        assert_eq!(updates, vec![running]);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"error":"Plan required","code":"plan_required"}"#), "Plan required");
        assert_eq!(error_message("bad gateway"), "bad gateway");
    }
}
