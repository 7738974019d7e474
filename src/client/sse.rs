//! Incremental `text/event-stream` decoding.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, if the server named the event
    pub event: Option<String>,

    /// `data:` lines joined with newlines
    pub data: String,
}

impl SseFrame {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).with_context(|| format!("Failed to decode SSE data: {}", self.data))
    }
}

/// Splits an SSE body into frames, whatever the chunk boundaries.
///
/// Comment lines (keep-alives) are skipped and unknown fields ignored. A
/// frame is dispatched on the blank line that ends it, so a trailing
/// unterminated frame is dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = std::str::from_utf8(&line[..pos]).context("SSE line is not valid UTF-8")?;
            let text = text.strip_suffix('\r').unwrap_or(text);
            if let Some(frame) = self.line(text) {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
