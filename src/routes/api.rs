//! OpenAI-compatible proxy handlers.
//!
//! Each handler runs the admission gate and hands the request to the
//! lifecycle orchestrator. Limit rejections surface before any upstream
//! work happens.

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::{
    api_types::{CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload},
    auth::admit,
    gateway::AppState,
};

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateChatCompletionPayload>,
) -> Response {
    match admit(&state.store, &state.limiter, &state.quota, &headers, Utc::now()).await {
        Ok(admission) => state.chat_completion(admission, payload).await,
        Err(e) => e.into_response(),
    }
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCompletionPayload>,
) -> Response {
    match admit(&state.store, &state.limiter, &state.quota, &headers, Utc::now()).await {
        Ok(admission) => state.completion(admission, payload).await,
        Err(e) => e.into_response(),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateEmbeddingPayload>,
) -> Response {
    match admit(&state.store, &state.limiter, &state.quota, &headers, Utc::now()).await {
        Ok(admission) => state.embedding(admission, payload).await,
        Err(e) => e.into_response(),
    }
}
