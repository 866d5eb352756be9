//! HTTP surface: the OpenAI-compatible proxy endpoints, the admin API, and
//! health.

pub mod admin;
pub mod api;
pub mod health;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::gateway::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Client-facing proxy surface.
        .route("/v1/chat/completions", post(api::chat_completions))
        .route("/v1/completions", post(api::completions))
        .route("/v1/embeddings", post(api::embeddings))
        // Admin surface.
        .route("/v1/cache/invalidate", post(admin::invalidate_cache))
        .route("/v1/cache/stats", get(admin::cache_stats))
        .route("/v1/cache/ttl", post(admin::update_ttl))
        .route("/v1/cache/threshold", post(admin::update_threshold))
        .route("/v1/cache/feedback", post(admin::add_feedback))
        .route(
            "/v1/cache/recommendations",
            get(admin::recommendations),
        )
        .route(
            "/v1/keys/provider",
            post(admin::save_provider_key).get(admin::list_provider_keys),
        )
        .route(
            "/v1/keys/provider/{id}",
            delete(admin::delete_provider_key),
        )
        .route("/v1/usage/stats", get(admin::usage_stats))
        .route("/v1/usage/timeseries", get(admin::usage_timeseries))
        .route("/v1/usage/logs", get(admin::usage_logs))
        .route("/v1/events", post(admin::ingest_events))
        .route(
            "/v1/agent-templates/{id}/deploy",
            post(admin::deploy_agent_template),
        )
        .route("/v1/cron/cost-alerts", post(admin::run_cost_alerts))
        // Operational.
        .route("/health", get(health::health))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
