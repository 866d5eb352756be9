//! Analytics sinks for the telemetry consumer.
//!
//! Sinks receive batches and write them in a single round trip. `eventId`
//! is the dedup key: replaying a batch (at-least-once delivery upstream)
//! never double-counts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::{EventKind, TelemetryEvent};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("analytics store error: {0}")]
    Store(String),

    #[error("analytics export failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One flattened, columnar-friendly analytics row.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsRow {
    pub event_id: Uuid,
    pub project_id: Uuid,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub env: String,
    pub kind: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_microcents: Option<i64>,
    pub latency_ms: Option<i64>,
    pub status: Option<String>,
    pub cached: bool,
    pub cache_similarity: Option<f64>,
    pub error_code: Option<String>,
    /// Full serialized event for kinds the flat columns do not cover.
    pub payload: serde_json::Value,
}

impl From<&TelemetryEvent> for AnalyticsRow {
    fn from(event: &TelemetryEvent) -> Self {
        let mut row = AnalyticsRow {
            event_id: event.event_id,
            project_id: event.project_id,
            run_id: event.run_id.clone(),
            timestamp: event.timestamp,
            env: serde_json::to_value(event.env)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            kind: event.kind.name().to_string(),
            model: None,
            provider: None,
            tokens_input: 0,
            tokens_output: 0,
            cost_microcents: None,
            latency_ms: None,
            status: None,
            cached: false,
            cache_similarity: None,
            error_code: None,
            payload: serde_json::to_value(event).unwrap_or_default(),
        };

        match &event.kind {
            EventKind::PromptCall {
                model,
                provider,
                tokens_input,
                tokens_output,
                cost_usd,
                latency_ms,
                status,
                cached,
                similarity,
                ..
            } => {
                row.model = Some(model.clone());
                row.provider = provider.clone();
                row.tokens_input = *tokens_input;
                row.tokens_output = *tokens_output;
                row.cost_microcents = cost_usd.map(|c| (c * 1_000_000.0).round() as i64);
                row.latency_ms = Some(*latency_ms);
                row.status = Some(status.clone());
                row.cached = *cached;
                row.cache_similarity = *similarity;
            }
            EventKind::Error { code, .. } => {
                row.status = Some("error".to_string());
                row.error_code = Some(code.clone());
            }
            _ => {}
        }
        row
    }
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Write a batch; returns the number of rows newly written (duplicates
    /// by `event_id` are skipped, not errors).
    async fn write_batch(&self, events: &[TelemetryEvent]) -> Result<usize, SinkError>;

    fn name(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory analytics store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory analytics store, also serving the aggregation queries.
#[derive(Default)]
pub struct MemoryAnalyticsSink {
    rows: RwLock<Vec<AnalyticsRow>>,
    seen: DashMap<Uuid, ()>,
}

impl MemoryAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for_project(&self, project_id: Uuid) -> Vec<AnalyticsRow> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalyticsSink {
    async fn write_batch(&self, events: &[TelemetryEvent]) -> Result<usize, SinkError> {
        let mut written = 0;
        let mut rows = self.rows.write();
        for event in events {
            if self.seen.insert(event.event_id, ()).is_some() {
                continue;
            }
            rows.push(AnalyticsRow::from(event));
            written += 1;
        }
        Ok(written)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP analytics export
// ─────────────────────────────────────────────────────────────────────────────

/// Exports rows to a columnar analytics store over HTTP, one batch per
/// round trip in JSON-lines form. Dedup on `event_id` happens at the
/// receiving store.
pub struct HttpAnalyticsSink {
    client: reqwest::Client,
    endpoint: String,
    credential: String,
}

impl HttpAnalyticsSink {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            credential: credential.into(),
        }
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn write_batch(&self, events: &[TelemetryEvent]) -> Result<usize, SinkError> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut body = String::new();
        for event in events {
            let row = AnalyticsRow::from(event);
            body.push_str(
                &serde_json::to_string(&row).map_err(|e| SinkError::Store(e.to_string()))?,
            );
            body.push('\n');
        }

        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.credential)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Fan out one batch to several sinks; a failing sink never blocks the rest.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn AnalyticsSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn AnalyticsSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AnalyticsSink for FanOutSink {
    async fn write_batch(&self, events: &[TelemetryEvent]) -> Result<usize, SinkError> {
        let mut written = 0;
        for sink in &self.sinks {
            match sink.write_batch(events).await {
                Ok(n) => written = written.max(n),
                Err(e) => {
                    tracing::warn!(sink = sink.name(), error = %e, "analytics sink write failed");
                }
            }
        }
        Ok(written)
    }

    fn name(&self) -> &'static str {
        "fan_out"
    }
}
