//! Aggregation queries over the analytics store.
//!
//! These back the dashboard read APIs: per-project stats over a date range,
//! fixed-period time series, and paginated log queries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sink::{AnalyticsRow, MemoryAnalyticsSink};

/// Time-series window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl Period {
    pub fn window(&self) -> Duration {
        match self {
            Period::Hour => Duration::hours(1),
            Period::SixHours => Duration::hours(6),
            Period::Day => Duration::hours(24),
            Period::Week => Duration::days(7),
            Period::Month => Duration::days(30),
        }
    }

    /// Bucket width for the window.
    pub fn bucket(&self) -> Duration {
        match self {
            Period::Hour => Duration::minutes(5),
            Period::SixHours => Duration::minutes(30),
            Period::Day => Duration::hours(1),
            Period::Week => Duration::hours(6),
            Period::Month => Duration::days(1),
        }
    }
}

/// Metric aggregated per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Requests,
    Cost,
    Latency,
    Errors,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectStats {
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub total_cost_microcents: i64,
    pub avg_latency_ms: f64,
}

/// Filter for paginated log queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub status: Option<String>,
    pub model: Option<String>,
    pub run_id: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

/// Read API over an analytics store.
pub trait AnalyticsQuery {
    fn project_stats(
        &self,
        project_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ProjectStats;

    fn timeseries(
        &self,
        project_id: Uuid,
        period: Period,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Vec<TimeSeriesPoint>;

    fn logs(&self, project_id: Uuid, query: &LogQuery) -> Vec<AnalyticsRow>;
}

fn metric_value(rows: &[&AnalyticsRow], metric: Metric) -> f64 {
    match metric {
        Metric::Requests => rows.len() as f64,
        Metric::Cost => rows
            .iter()
            .filter_map(|r| r.cost_microcents)
            .sum::<i64>() as f64
            / 1_000_000.0,
        Metric::Latency => {
            let latencies: Vec<i64> = rows.iter().filter_map(|r| r.latency_ms).collect();
            if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<i64>() as f64 / latencies.len() as f64
            }
        }
        Metric::Errors => rows
            .iter()
            .filter(|r| r.status.as_deref() == Some("error"))
            .count() as f64,
    }
}

impl AnalyticsQuery for MemoryAnalyticsSink {
    fn project_stats(
        &self,
        project_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ProjectStats {
        let rows: Vec<AnalyticsRow> = self
            .rows_for_project(project_id)
            .into_iter()
            .filter(|r| r.kind == "prompt_call" && r.timestamp >= from && r.timestamp < to)
            .collect();

        let requests = rows.len() as u64;
        let errors = rows
            .iter()
            .filter(|r| r.status.as_deref() == Some("error"))
            .count() as u64;
        let cache_hits = rows.iter().filter(|r| r.cached).count() as u64;
        let latencies: Vec<i64> = rows.iter().filter_map(|r| r.latency_ms).collect();

        ProjectStats {
            requests,
            errors,
            cache_hits,
            cache_hit_rate: if requests == 0 {
                0.0
            } else {
                cache_hits as f64 / requests as f64
            },
            tokens_input: rows.iter().map(|r| r.tokens_input).sum(),
            tokens_output: rows.iter().map(|r| r.tokens_output).sum(),
            total_cost_microcents: rows.iter().filter_map(|r| r.cost_microcents).sum(),
            avg_latency_ms: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<i64>() as f64 / latencies.len() as f64
            },
        }
    }

    fn timeseries(
        &self,
        project_id: Uuid,
        period: Period,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Vec<TimeSeriesPoint> {
        let window_start = now - period.window();
        let bucket = period.bucket();
        let rows: Vec<AnalyticsRow> = self
            .rows_for_project(project_id)
            .into_iter()
            .filter(|r| r.kind == "prompt_call" && r.timestamp >= window_start && r.timestamp < now)
            .collect();

        let mut points = Vec::new();
        let mut bucket_start = window_start;
        while bucket_start < now {
            let bucket_end = bucket_start + bucket;
            let in_bucket: Vec<&AnalyticsRow> = rows
                .iter()
                .filter(|r| r.timestamp >= bucket_start && r.timestamp < bucket_end)
                .collect();
            points.push(TimeSeriesPoint {
                bucket_start,
                value: metric_value(&in_bucket, metric),
            });
            bucket_start = bucket_end;
        }
        points
    }

    fn logs(&self, project_id: Uuid, query: &LogQuery) -> Vec<AnalyticsRow> {
        let limit = if query.limit == 0 { 50 } else { query.limit.min(500) };
        let mut rows = self.rows_for_project(project_id);
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.into_iter()
            .filter(|r| query.status.as_deref().is_none_or(|s| r.status.as_deref() == Some(s)))
            .filter(|r| query.model.as_deref().is_none_or(|m| r.model.as_deref() == Some(m)))
            .filter(|r| query.run_id.as_deref().is_none_or(|id| r.run_id == id))
            .skip(query.offset)
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{AnalyticsSink, EnvKind, TelemetryEvent};

    async fn seeded_sink(project: Uuid) -> MemoryAnalyticsSink {
        let sink = MemoryAnalyticsSink::new();
        let mut events = Vec::new();
        for i in 0..10 {
            let mut event = TelemetryEvent::prompt_call(
                project,
                format!("run-{}", i % 2),
                EnvKind::Production,
                if i % 2 == 0 { "m-1" } else { "m-2" }.to_string(),
                Some("openai".to_string()),
                100,
                50,
                Some(0.001),
                100 + i,
                if i == 9 { "error" } else { "success" }.to_string(),
                i < 3,
                None,
            );
            event.timestamp = Utc::now() - Duration::minutes(i);
            events.push(event);
        }
        sink.write_batch(&events).await.unwrap();
        sink
    }

    #[tokio::test]
    async fn project_stats_aggregate_the_range() {
        let project = Uuid::new_v4();
        let sink = seeded_sink(project).await;

        let stats = sink.project_stats(
            project,
            Utc::now() - Duration::hours(1),
            Utc::now() + Duration::minutes(1),
        );
        assert_eq!(stats.requests, 10);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.cache_hits, 3);
        assert!((stats.cache_hit_rate - 0.3).abs() < 1e-9);
        assert_eq!(stats.tokens_input, 1_000);
        assert_eq!(stats.total_cost_microcents, 10_000);
        assert!(stats.avg_latency_ms > 100.0);
    }

    #[tokio::test]
    async fn stats_respect_the_date_range() {
        let project = Uuid::new_v4();
        let sink = seeded_sink(project).await;
        // A range in the past excludes everything.
        let stats = sink.project_stats(
            project,
            Utc::now() - Duration::days(30),
            Utc::now() - Duration::days(29),
        );
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.cache_hit_rate, 0.0);
    }

    #[tokio::test]
    async fn timeseries_buckets_cover_the_window() {
        let project = Uuid::new_v4();
        let sink = seeded_sink(project).await;

        let points = sink.timeseries(project, Period::Hour, Metric::Requests, Utc::now());
        assert_eq!(points.len(), 12); // 1h window / 5m buckets
        let total: f64 = points.iter().map(|p| p.value).sum();
        assert_eq!(total, 10.0);

        let errors = sink.timeseries(project, Period::Hour, Metric::Errors, Utc::now());
        let total_errors: f64 = errors.iter().map(|p| p.value).sum();
        assert_eq!(total_errors, 1.0);
    }

    #[tokio::test]
    async fn log_query_filters_and_paginates() {
        let project = Uuid::new_v4();
        let sink = seeded_sink(project).await;

        let all = sink.logs(project, &LogQuery::default());
        assert_eq!(all.len(), 10);
        // Newest first.
        assert!(all[0].timestamp >= all[9].timestamp);

        let errors = sink.logs(
            project,
            &LogQuery {
                status: Some("error".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(errors.len(), 1);

        let m1 = sink.logs(
            project,
            &LogQuery {
                model: Some("m-1".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(m1.len(), 5);

        let run0 = sink.logs(
            project,
            &LogQuery {
                run_id: Some("run-0".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(run0.len(), 5);

        let page = sink.logs(
            project,
            &LogQuery {
                offset: 8,
                limit: 5,
                ..Default::default()
            },
        );
        assert_eq!(page.len(), 2);
    }
}
