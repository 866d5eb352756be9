//! Gateway error taxonomy and the client-facing error envelope.
//!
//! Every error carries a stable `code` string and a message that is safe to
//! show to end users; provider-internal strings are never forwarded verbatim.
//! Silent-degrade kinds (embedder, vector index, cache insert, telemetry)
//! exist so internal call sites can classify failures, but the orchestrator
//! never surfaces them to clients.

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Extra detail attached to limit errors.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LimitDetails {
    pub limit: u64,
    pub remaining: u64,
    #[serde(rename = "resetAt")]
    pub reset_at: i64,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid or inactive gateway key")]
    Unauthorized,

    #[error("rate limit exceeded: {limit} requests per minute")]
    RateLimited {
        limit: u64,
        remaining: u64,
        reset_at: i64,
        retry_after: u64,
    },

    #[error("monthly quota exceeded: {limit} requests per month")]
    QuotaExceeded {
        limit: u64,
        remaining: u64,
        reset_at: i64,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("failed to decrypt provider key")]
    Decrypt,

    #[error("provider rejected the configured credentials")]
    UpstreamAuth,

    #[error("provider is unavailable")]
    UpstreamUnavailable,

    #[error("provider did not respond in time")]
    UpstreamTimeout,

    #[error("provider returned an unexpected response shape")]
    UpstreamSchema,

    #[error("embedding generation failed: {0}")]
    EmbedderFailed(String),

    #[error("vector index operation failed: {0}")]
    VectorIndexFailed(String),

    #[error("cache insert failed: {0}")]
    CacheInsertFailed(String),

    #[error("telemetry event dropped: {0}")]
    TelemetryDropped(String),

    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config_error",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Decrypt => "decrypt_failed",
            GatewayError::UpstreamAuth => "upstream_auth_failed",
            GatewayError::UpstreamUnavailable => "upstream_unavailable",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamSchema => "upstream_schema",
            GatewayError::EmbedderFailed(_) => "embedder_failed",
            GatewayError::VectorIndexFailed(_) => "vector_index_failed",
            GatewayError::CacheInsertFailed(_) => "cache_insert_failed",
            GatewayError::TelemetryDropped(_) => "telemetry_dropped",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Coarse error family, mirrored in the envelope's `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded { .. } => {
                "rate_limit_error"
            }
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::UpstreamAuth
            | GatewayError::UpstreamUnavailable
            | GatewayError::UpstreamTimeout
            | GatewayError::UpstreamSchema => "upstream_error",
            _ => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamAuth
            | GatewayError::UpstreamUnavailable
            | GatewayError::UpstreamSchema => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the orchestrator degrades silently instead of surfacing
    /// this error to the client.
    pub fn degrades_silently(&self) -> bool {
        matches!(
            self,
            GatewayError::EmbedderFailed(_)
                | GatewayError::VectorIndexFailed(_)
                | GatewayError::CacheInsertFailed(_)
                | GatewayError::TelemetryDropped(_)
        )
    }

    fn limit_details(&self) -> Option<LimitDetails> {
        match self {
            GatewayError::RateLimited {
                limit,
                remaining,
                reset_at,
                retry_after,
            } => Some(LimitDetails {
                limit: *limit,
                remaining: *remaining,
                reset_at: *reset_at,
                retry_after: Some(*retry_after),
            }),
            GatewayError::QuotaExceeded {
                limit,
                remaining,
                reset_at,
            } => Some(LimitDetails {
                limit: *limit,
                remaining: *remaining,
                reset_at: *reset_at,
                retry_after: None,
            }),
            _ => None,
        }
    }

    /// Message safe to show to end users. Internal detail stays in logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "internal error".to_string(),
            GatewayError::Config(_) => "gateway misconfigured".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<LimitDetails>,
}

/// The wire envelope: `{ "error": { message, type, code, details? } }`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl From<&GatewayError> for ErrorEnvelope {
    fn from(err: &GatewayError) -> Self {
        ErrorEnvelope {
            error: ErrorBody {
                message: err.public_message(),
                type_: err.error_type(),
                code: err.code(),
                details: err.limit_details(),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, GatewayError::Internal(_) | GatewayError::Config(_)) {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }

        let status = self.status();
        let envelope = ErrorEnvelope::from(&self);
        let mut response = (status, Json(envelope)).into_response();

        if let GatewayError::RateLimited { retry_after, .. } = &self
            && let Ok(v) = HeaderValue::try_from(retry_after.to_string())
        {
            response.headers_mut().insert("Retry-After", v);
        }

        response
    }
}
