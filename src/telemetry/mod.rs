//! Telemetry pipeline: event schema, redaction, durable queueing, and the
//! analytics sink fan-out.

pub mod query;
pub mod queue;
pub mod redact;
pub mod sink;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use query::{AnalyticsQuery, LogQuery, Metric, Period, ProjectStats, TimeSeriesPoint};
pub use queue::{TelemetryQueue, TelemetryWorker};
pub use redact::redact_event;
pub use sink::{
    AnalyticsRow, AnalyticsSink, FanOutSink, HttpAnalyticsSink, MemoryAnalyticsSink, SinkError,
};

/// Deployment environment an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    Production,
    Staging,
    Development,
}

/// Client SDK identification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub sdk_version: String,
    pub platform: String,
}

/// Event payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename_all = "camelCase")]
    PromptCall {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        tokens_input: i64,
        tokens_output: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        latency_ms: i64,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_summary: Option<String>,
        cached: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        similarity: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    AgentStep {
        step: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
    #[serde(rename_all = "camelCase")]
    AssertionFailed {
        assertion: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HallucinationDetected { claim: String, confidence: f64 },
    #[serde(rename_all = "camelCase")]
    CostThresholdExceeded {
        threshold_pct: u8,
        month_to_date: u64,
        limit: u64,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PromptCall { .. } => "prompt_call",
            EventKind::AgentStep { .. } => "agent_step",
            EventKind::Error { .. } => "error",
            EventKind::AssertionFailed { .. } => "assertion_failed",
            EventKind::HallucinationDetected { .. } => "hallucination_detected",
            EventKind::CostThresholdExceeded { .. } => "cost_threshold_exceeded",
        }
    }
}

/// One telemetry event. `event_id` is the dedup key at the sink, so
/// delivery can be at-least-once everywhere upstream of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub event_id: Uuid,
    pub project_id: Uuid,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub env: EnvKind,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TelemetryEvent {
    /// A gateway-originated prompt_call event for one request.
    #[allow(clippy::too_many_arguments)]
    pub fn prompt_call(
        project_id: Uuid,
        run_id: String,
        env: EnvKind,
        model: String,
        provider: Option<String>,
        tokens_input: i64,
        tokens_output: i64,
        cost_usd: Option<f64>,
        latency_ms: i64,
        status: String,
        cached: bool,
        similarity: Option<f64>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            project_id,
            run_id,
            timestamp: Utc::now(),
            env,
            tags: Vec::new(),
            client: None,
            kind: EventKind::PromptCall {
                model,
                provider,
                tokens_input,
                tokens_output,
                cost_usd,
                latency_ms,
                status,
                response_summary: None,
                cached,
                similarity,
            },
        }
    }
}
