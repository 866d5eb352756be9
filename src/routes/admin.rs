//! Admin API handlers.
//!
//! Every call authenticates with a gateway key; the key's project is the
//! target, so a caller can never reach another project's state. The cron
//! trigger authenticates with the shared cron secret instead.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    admin,
    auth::authenticate,
    cache::InvalidationFilter,
    error::GatewayError,
    models::{CacheFeedback, CacheTtl, ProviderKind},
    store::UsageLogFilter,
    telemetry::{AnalyticsQuery, LogQuery, Metric, Period, TelemetryEvent},
    gateway::AppState,
};

// ─────────────────────────────────────────────────────────────────────────────
// Cache management
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub model: Option<String>,
    /// Endpoint path to restrict the invalidation to.
    pub kind: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub all: bool,
}

pub async fn invalidate_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let filter = InvalidationFilter {
        model: request.model,
        endpoint_path: request.kind,
        before: request.before,
        after: request.after,
        all: request.all,
    };
    match admin::invalidate_cache(&state.cache, project.id, &filter).await {
        Ok(count) => Json(json!({ "entries_invalidated": count })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn cache_stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match admin::cache_age_stats(state.cache.index(), project.id).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateTtlRequest {
    pub default_ttl: CacheTtl,
    #[serde(default)]
    pub overrides: std::collections::HashMap<String, CacheTtl>,
}

pub async fn update_ttl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateTtlRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match admin::update_cache_ttl(&state.store, project.id, request.default_ttl, request.overrides)
        .await
    {
        Ok(project) => Json(json!({
            "default_ttl": project.cache_ttl,
            "overrides": project.cache_ttl_overrides,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateThresholdRequest {
    pub threshold: f64,
}

pub async fn update_threshold(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateThresholdRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match admin::update_semantic_threshold(&state.store, project.id, request.threshold).await {
        Ok(project) => {
            Json(json!({ "threshold": project.semantic_cache_threshold })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub cache_entry_fingerprint: String,
    pub accurate: bool,
    pub similarity_score: f64,
}

pub async fn add_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FeedbackRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let feedback = CacheFeedback {
        id: Uuid::new_v4(),
        project_id: project.id,
        cache_entry_fingerprint: request.cache_entry_fingerprint,
        accurate: request.accurate,
        similarity_score: request.similarity_score,
        created_at: Utc::now(),
    };
    match state.store.add_feedback(feedback).await {
        Ok(()) => Json(json!({ "recorded": true })).into_response(),
        Err(e) => GatewayError::Internal(e.to_string()).into_response(),
    }
}

pub async fn recommendations(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let feedback = match state.store.feedback(project.id).await {
        Ok(f) => f,
        Err(e) => return GatewayError::Internal(e.to_string()).into_response(),
    };
    let threshold =
        admin::threshold_recommendation(project.semantic_cache_threshold, &feedback);
    let ttl = match admin::ttl_recommendation(state.cache.index(), project.id, project.cache_ttl)
        .await
    {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    Json(json!({ "threshold": threshold, "ttl": ttl })).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider keys
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SaveProviderKeyRequest {
    pub provider: ProviderKind,
    pub key: String,
    pub name: String,
}

pub async fn save_provider_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SaveProviderKeyRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match admin::save_provider_key(
        &state.store,
        &state.vault,
        project.id,
        request.provider,
        &request.key,
        &request.name,
    )
    .await
    {
        Ok(key) => Json(json!({
            "id": key.id,
            "provider": key.provider,
            "name": key.name,
            "priority": key.priority,
            "is_active": key.is_active,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn list_provider_keys(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match admin::list_provider_keys(&state.store, &state.vault, project.id).await {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_provider_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match admin::delete_provider_key(&state.store, project.id, id).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => e.into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Usage read APIs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn usage_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - chrono::Duration::days(30));
    Json(state.analytics.project_stats(project.id, from, to)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub period: Period,
    pub metric: Metric,
}

pub async fn usage_timeseries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TimeseriesQuery>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    Json(state.analytics.timeseries(project.id, query.period, query.metric, Utc::now()))
        .into_response()
}

pub async fn usage_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogQuery>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    // Serve from the analytics store when populated; fall back to the
    // gateway store's raw usage rows.
    let rows = state.analytics.logs(project.id, &query);
    if !rows.is_empty() {
        return Json(rows).into_response();
    }
    let filter = UsageLogFilter {
        status: None,
        model: query.model.clone(),
        from: None,
        to: None,
        offset: query.offset,
        limit: query.limit,
    };
    match state.store.usage_logs(project.id, &filter).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => GatewayError::Internal(e.to_string()).into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event ingestion & templates
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<TelemetryEvent>,
}

/// Accept client-submitted telemetry (agent debug events included). Events
/// are forced onto the caller's project before redaction and enqueue.
pub async fn ingest_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let mut accepted = 0usize;
    let mut dropped_oldest = 0usize;
    for mut event in request.events {
        event.project_id = project.id;
        if state.telemetry.enqueue(event) {
            accepted += 1;
        } else {
            accepted += 1;
            dropped_oldest += 1;
        }
    }
    Json(json!({ "accepted": accepted, "displaced": dropped_oldest })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployTemplateRequest {
    pub project_id: Uuid,
}

/// Agent-template deployment is a simple write; the dashboard consumes the
/// returned URL.
pub async fn deploy_agent_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(template_id): Path<String>,
    Json(request): Json<DeployTemplateRequest>,
) -> Response {
    let (_, project, _) = match authenticate(&state.store, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    if project.id != request.project_id {
        return GatewayError::Unauthorized.into_response();
    }
    Json(json!({
        "deployment": {
            "dashboardUrl": format!(
                "/projects/{}/agent-templates/{}",
                project.id, template_id
            ),
        }
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Cron
// ─────────────────────────────────────────────────────────────────────────────

/// Scheduled-trigger entry point for the cost-alert sweep. Authenticated by
/// the shared cron secret, not a gateway key.
pub async fn run_cost_alerts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let presented = headers
        .get("X-Cron-Secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.config.cron_secret {
        return GatewayError::Unauthorized.into_response();
    }

    let dispatcher = admin::LogAlertDispatcher;
    match admin::cost_alerts_sweep(
        &state.store,
        &state.quota,
        &state.telemetry,
        &dispatcher,
        state.config.env,
        Utc::now(),
    )
    .await
    {
        Ok(dispatched) => Json(json!({ "alerts_dispatched": dispatched })).into_response(),
        Err(e) => e.into_response(),
    }
}
