//! Request telemetry hook points. The core records what it saw; sinks
//! decide where it goes. Presence of a sink is never a correctness
//! requirement.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::info;

/// Counters sniffed from a response, streamed or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
    pub text_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
    ClientDisconnected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
            Outcome::ClientDisconnected => "client disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub trace_id: String,
    pub endpoint: &'static str,
    pub model: String,
    pub status: u16,
    pub outcome: Outcome,
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
    pub stats: StreamStats,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &RequestRecord);
}

/// Default sink: one structured log line per request.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, record: &RequestRecord) {
        info!(
            trace_id = %record.trace_id,
            endpoint = record.endpoint,
            model = %record.model,
            status = record.status,
            outcome = record.outcome.as_str(),
            elapsed_ms = record.elapsed.as_millis() as u64,
            input_tokens = record.stats.input_tokens,
            output_tokens = record.stats.output_tokens,
            stop_reason = record.stats.stop_reason.as_deref(),
            "request complete"
        );
    }
}

pub type SharedSink = Arc<dyn TelemetrySink>;
