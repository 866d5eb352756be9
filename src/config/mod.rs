//! Environment-driven configuration.
//!
//! Required parameters abort startup when absent; optional ones fall back
//! to defaults. All variables share the `ECHOGATE_` prefix.

use std::env;

use crate::{error::GatewayError, telemetry::EnvKind};

/// Default inline-body cap. Responses above it are not cached.
pub const DEFAULT_MAX_INLINE_BODY_BYTES: usize = 64 * 1024;
/// Default inter-frame pacing for cached stream replay.
pub const DEFAULT_REPLAY_DELAY_MS: u64 = 15;
/// Default embedding dimension.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// Embedding backend selection.
#[derive(Debug, Clone)]
pub enum EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint.
    Http {
        base_url: String,
        api_key: String,
        model: String,
        dimensions: usize,
    },
    /// Deterministic offline embedder; no network, lower recall.
    Hashing { dimensions: usize },
}

impl EmbeddingConfig {
    pub fn dimensions(&self) -> usize {
        match self {
            EmbeddingConfig::Http { dimensions, .. } => *dimensions,
            EmbeddingConfig::Hashing { dimensions } => *dimensions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the server binds to.
    pub bind_addr: String,
    /// Master secret for the provider-key vault.
    pub master_secret: String,
    /// Shared secret authorizing scheduled-trigger endpoints.
    pub cron_secret: String,
    /// Columnar analytics store export target; absent means memory-only.
    pub analytics_endpoint: Option<String>,
    pub analytics_credential: Option<String>,
    /// Deployment environment tagged onto telemetry.
    pub env: EnvKind,
    /// Whether the response cache is active.
    pub cache_enabled: bool,
    /// Pacing between replayed SSE frames.
    pub replay_delay_ms: u64,
    /// Responses larger than this are not cached inline.
    pub max_inline_body_bytes: usize,
    pub embedding: EmbeddingConfig,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, GatewayError> {
        let master_secret = var("ECHOGATE_MASTER_SECRET").ok_or_else(|| {
            GatewayError::Config("ECHOGATE_MASTER_SECRET is required".to_string())
        })?;
        let cron_secret = var("ECHOGATE_CRON_SECRET").ok_or_else(|| {
            GatewayError::Config("ECHOGATE_CRON_SECRET is required".to_string())
        })?;

        let analytics_endpoint = var("ECHOGATE_ANALYTICS_URL");
        let analytics_credential = var("ECHOGATE_ANALYTICS_CREDENTIAL");
        if analytics_endpoint.is_some() && analytics_credential.is_none() {
            return Err(GatewayError::Config(
                "ECHOGATE_ANALYTICS_CREDENTIAL is required when ECHOGATE_ANALYTICS_URL is set"
                    .to_string(),
            ));
        }

        let env_kind = match var("ECHOGATE_ENV").as_deref() {
            None | Some("production") => EnvKind::Production,
            Some("staging") => EnvKind::Staging,
            Some("development") => EnvKind::Development,
            Some(other) => {
                return Err(GatewayError::Config(format!(
                    "ECHOGATE_ENV must be production|staging|development, got {other}"
                )));
            }
        };

        let dimensions = var("ECHOGATE_EMBEDDING_DIMENSIONS")
            .map(|v| {
                v.parse::<usize>().map_err(|_| {
                    GatewayError::Config("ECHOGATE_EMBEDDING_DIMENSIONS must be an integer".into())
                })
            })
            .transpose()?
            .unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS);
        let embedding = match (var("ECHOGATE_EMBEDDING_URL"), var("ECHOGATE_EMBEDDING_KEY")) {
            (Some(base_url), Some(api_key)) => EmbeddingConfig::Http {
                base_url,
                api_key,
                model: var("ECHOGATE_EMBEDDING_MODEL")
                    .unwrap_or_else(|| "text-embedding-3-small".to_string()),
                dimensions,
            },
            (Some(_), None) => {
                return Err(GatewayError::Config(
                    "ECHOGATE_EMBEDDING_KEY is required when ECHOGATE_EMBEDDING_URL is set"
                        .to_string(),
                ));
            }
            _ => EmbeddingConfig::Hashing { dimensions },
        };

        Ok(Self {
            bind_addr: var("ECHOGATE_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            master_secret,
            cron_secret,
            analytics_endpoint,
            analytics_credential,
            env: env_kind,
            cache_enabled: var("ECHOGATE_CACHE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            replay_delay_ms: var("ECHOGATE_REPLAY_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REPLAY_DELAY_MS),
            max_inline_body_bytes: var("ECHOGATE_MAX_INLINE_BODY_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_INLINE_BODY_BYTES),
            embedding,
        })
    }

    /// A configuration for tests and local bring-up.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            master_secret: "test-master-secret".to_string(),
            cron_secret: "test-cron-secret".to_string(),
            analytics_endpoint: None,
            analytics_credential: None,
            env: EnvKind::Development,
            cache_enabled: true,
            replay_delay_ms: 0,
            max_inline_body_bytes: DEFAULT_MAX_INLINE_BODY_BYTES,
            embedding: EmbeddingConfig::Hashing { dimensions: 256 },
        }
    }
}
