use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::gateway::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "cache_enabled": state.cache.is_enabled(),
        "telemetry_dropped": state.telemetry.dropped_count(),
        "priced_models": state.pricing.len(),
    }))
}
