//! Usage extraction from upstream responses.
//!
//! Non-streaming primary responses carry a structured `usage` block.
//! Streaming responses are scanned chunk-by-chunk with a regex; the last
//! match for each counter wins. Counts split across chunk boundaries are
//! missed by design of the scan.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static INPUT_TOKENS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""input_tokens"\s*:\s*(\d+)"#).expect("valid regex"));
static OUTPUT_TOKENS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""output_tokens"\s*:\s*(\d+)"#).expect("valid regex"));

/// Token counts pulled from one upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
}

/// Parse the primary-schema usage block from a complete response body.
/// Absent fields fall back to zero.
pub fn parse_usage_block(body: &Value) -> UsageCounts {
    let usage = &body["usage"];
    UsageCounts {
        input_tokens: usage["input_tokens"].as_i64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_i64().unwrap_or(0),
        cache_read_tokens: usage["cache_read_input_tokens"].as_i64().unwrap_or(0),
        cache_write_tokens: usage["cache_creation_input_tokens"].as_i64().unwrap_or(0),
    }
}

/// Incremental scanner over streamed chunks.
#[derive(Debug, Default)]
pub struct StreamScanner {
    counts: UsageCounts,
}

impl StreamScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan one chunk of the upstream stream. Later matches overwrite
    /// earlier ones, so the final event's counts are the ones kept.
    pub fn scan_chunk(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);

        for cap in INPUT_TOKENS_RE.captures_iter(&text) {
            if let Ok(n) = cap[1].parse::<i64>() {
                self.counts.input_tokens = n;
            }
        }
        for cap in OUTPUT_TOKENS_RE.captures_iter(&text) {
            if let Ok(n) = cap[1].parse::<i64>() {
                self.counts.output_tokens = n;
            }
        }
    }

    pub fn counts(&self) -> UsageCounts {
        self.counts
    }
}
