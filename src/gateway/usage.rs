//! Per-call usage records.
//!
//! The gateway reports every completion attempt through a `UsageSink`:
//! - the CLI uses `TracingUsageSink`
//! - tests use `NoopUsageSink` or their own recording sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionCallRecord {
    pub provider: &'static str,
    pub model: String,
    pub caller: &'static str,
    pub execution_id: Option<String>,
    pub team_id: Option<i64>,
    pub attempt: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CompletionCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            caller,
            execution_id: None,
            team_id: None,
            attempt: 0,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn execution(mut self, execution_id: Option<String>, team_id: Option<i64>) -> Self {
        self.execution_id = execution_id;
        self.team_id = team_id;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>, request_id: Option<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self.request_id = request_id;
        self
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: CompletionCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: CompletionCallRecord) {}
}

/// Emits one `debug` event per completion call (`warn` on errors).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: CompletionCallRecord) {
        match record.status {
            CallStatus::Success => tracing::debug!(
                provider = record.provider,
                model = %record.model,
                caller = record.caller,
                execution_id = record.execution_id.as_deref().unwrap_or("-"),
                attempt = record.attempt,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                latency_ms = record.latency_ms,
                "completion call"
            ),
            CallStatus::Error => tracing::warn!(
                provider = record.provider,
                model = %record.model,
                caller = record.caller,
                execution_id = record.execution_id.as_deref().unwrap_or("-"),
                attempt = record.attempt,
                error_code = record.error_code.as_deref().unwrap_or("unknown"),
                request_id = record.request_id.as_deref().unwrap_or("-"),
                "completion call failed"
            ),
        }
    }
}
