//! Embedding generation for semantic cache lookups.
//!
//! The cache engine only needs one capability: turn a normalized prompt into
//! a unit-length dense vector. The HTTP implementation calls an
//! OpenAI-compatible `/v1/embeddings` endpoint; the hashing implementation is
//! deterministic and offline, used in tests and as a no-network fallback.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Deadline for one embedding call.
pub const EMBED_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding request timed out")]
    Timeout,

    #[error("embedding provider returned an unexpected response: {0}")]
    Schema(String),

    #[error("embedding provider returned no vectors")]
    EmptyResponse,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a unit-normalized vector of `dimensions()` floats.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    fn dimensions(&self) -> usize;
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn unit_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP embedder
// ─────────────────────────────────────────────────────────────────────────────

/// Embedder backed by an OpenAI-compatible embeddings endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        let response = tokio::time::timeout(EMBED_TIMEOUT, send)
            .await
            .map_err(|_| EmbedderError::Timeout)??
            .error_for_status()?;

        let parsed: serde_json::Value = tokio::time::timeout(EMBED_TIMEOUT, response.json())
            .await
            .map_err(|_| EmbedderError::Timeout)??;

        let vector = parsed
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .and_then(|obj| obj.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or(EmbedderError::EmptyResponse)?
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| EmbedderError::Schema("non-numeric embedding".to_string()))
            })
            .collect::<Result<Vec<f32>, _>>()?;

        if vector.is_empty() {
            return Err(EmbedderError::EmptyResponse);
        }
        Ok(unit_normalize(vector))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hashing embedder
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed into a bucket with a signed
/// contribution, and the result is unit-normalized. Texts sharing tokens get
/// proportionally similar vectors, which is enough to exercise the semantic
/// lookup path without a network.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimensions;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        Ok(unit_normalize(vector))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
