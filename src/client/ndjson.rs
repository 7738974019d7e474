//! Incremental NDJSON line decoding.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Splits a byte stream into JSON lines, whatever the chunk boundaries.
///
/// Bytes are buffered until a newline arrives, so a multi-byte UTF-8
/// sequence or a JSON object split across chunks decodes intact.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and decode every line it completes
    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Result<Vec<T>> {
        self.buffer.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = decode_line(&line[..pos])? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Decode a trailing line that was not newline-terminated
    pub fn finish<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>> {
    let text = std::str::from_utf8(line).context("NDJSON line is not valid UTF-8")?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .with_context(|| format!("Failed to decode NDJSON line: {}", text))
}
