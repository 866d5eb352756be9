//! Upstream LLM provider implementations.
//!
//! Providers are polymorphic over one capability set: build the wire
//! request, parse the response into the canonical shape, translate stream
//! chunks, and map errors. New providers implement [`ProviderAdapter`];
//! call sites never branch on the provider name.

pub mod anthropic;
pub mod open_ai;
pub mod router;

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

use crate::{error::GatewayError, models::ProviderKind};

pub use anthropic::AnthropicAdapter;
pub use open_ai::OpenAiCompatibleAdapter;
pub use router::{ProviderRouter, UpstreamBody, UpstreamSuccess};

/// Client-facing endpoints the gateway proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl EndpointKind {
    pub fn path(&self) -> &'static str {
        match self {
            EndpointKind::ChatCompletions => "/v1/chat/completions",
            EndpointKind::Completions => "/v1/completions",
            EndpointKind::Embeddings => "/v1/embeddings",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/v1/chat/completions" => Some(EndpointKind::ChatCompletions),
            "/v1/completions" => Some(EndpointKind::Completions),
            "/v1/embeddings" => Some(EndpointKind::Embeddings),
            _ => None,
        }
    }

    /// All proxied endpoint paths, used for TTL-override key validation.
    pub fn all_paths() -> [&'static str; 3] {
        [
            "/v1/chat/completions",
            "/v1/completions",
            "/v1/embeddings",
        ]
    }
}

/// Classified upstream failure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The provider rejected the credential (401/403). Fail over.
    #[error("provider authentication failed")]
    Auth,

    /// The provider throttled us. Honor short Retry-After, else fail over.
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx or connection-level failure. Fail over.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider exceeded a deadline.
    #[error("provider timed out")]
    Timeout,

    /// The response did not match the expected schema.
    #[error("provider response schema mismatch: {0}")]
    Schema(String),

    /// The provider rejected the request itself. Not retryable.
    #[error("{0}")]
    BadRequest(String),

    /// The endpoint is not supported by this provider.
    #[error("{0}")]
    Unsupported(String),
}

impl UpstreamError {
    /// Whether the router should try the next key.
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            UpstreamError::Auth
                | UpstreamError::Unavailable(_)
                | UpstreamError::Timeout
                | UpstreamError::RateLimited { .. }
        )
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Auth => GatewayError::UpstreamAuth,
            UpstreamError::RateLimited { .. } | UpstreamError::Unavailable(_) => {
                GatewayError::UpstreamUnavailable
            }
            UpstreamError::Timeout => GatewayError::UpstreamTimeout,
            UpstreamError::Schema(_) => GatewayError::UpstreamSchema,
            UpstreamError::BadRequest(msg) | UpstreamError::Unsupported(msg) => {
                GatewayError::BadRequest(msg)
            }
        }
    }
}

/// Classify an HTTP status from a provider.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> UpstreamError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Auth,
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited { retry_after },
        s if s.is_server_error() => UpstreamError::Unavailable(format!("status {s}")),
        s => UpstreamError::BadRequest(format!("provider rejected the request ({s})")),
    }
}

/// Stateful translation of one provider stream into canonical
/// `chat.completion.chunk` SSE frames.
pub trait StreamTranslator: Send {
    /// Feed raw provider bytes; returns zero or more canonical frames.
    fn push(&mut self, bytes: &[u8]) -> Vec<Bytes>;

    /// Emit any trailing frames once the provider stream ends.
    fn finish(&mut self) -> Vec<Bytes>;
}

/// The provider capability set.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Full URL serving the given endpoint.
    fn request_url(&self, endpoint: EndpointKind) -> Result<String, UpstreamError>;

    /// Translate an OpenAI-shaped request body into the provider's format.
    fn build_request(
        &self,
        endpoint: EndpointKind,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError>;

    /// Attach the decrypted credential.
    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder;

    /// Normalize a successful non-streaming response body to the canonical
    /// OpenAI-compatible shape.
    fn parse_response(
        &self,
        endpoint: EndpointKind,
        body: &[u8],
    ) -> Result<serde_json::Value, UpstreamError>;

    /// Fresh per-stream translator.
    fn stream_translator(&self) -> Box<dyn StreamTranslator>;

    /// Map a non-success status + body into the error taxonomy.
    fn map_error(&self, status: StatusCode, body: &[u8]) -> UpstreamError;
}

/// Build the adapter for a provider kind with its default base URL.
pub fn default_adapter(kind: ProviderKind) -> Box<dyn ProviderAdapter> {
    match kind {
        ProviderKind::OpenAi => Box::new(OpenAiCompatibleAdapter::new(
            ProviderKind::OpenAi,
            "https://api.openai.com",
        )),
        ProviderKind::Groq => Box::new(OpenAiCompatibleAdapter::new(
            ProviderKind::Groq,
            "https://api.groq.com/openai",
        )),
        ProviderKind::OpenRouter => Box::new(OpenAiCompatibleAdapter::new(
            ProviderKind::OpenRouter,
            "https://openrouter.ai/api",
        )),
        ProviderKind::Anthropic => Box::new(AnthropicAdapter::new("https://api.anthropic.com")),
    }
}
