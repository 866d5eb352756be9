//! Deterministic request fingerprinting.
//!
//! A fingerprint is the lowercase hex SHA-256 of the canonical JSON (sorted
//! keys, UTF-8) of a normalized request. Normalization trims whitespace at
//! message boundaries, lower-cases role names, and drops server-controlled
//! fields (`stream`, user identifiers), so the same logical request always
//! hashes the same and any retained byte change produces a new fingerprint.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::api_types::{
    CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload, Message,
};

/// One normalized message: lowercase role, boundary-trimmed content.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NormalizedMessage {
    pub role: String,
    pub content: String,
}

/// The normalized request the fingerprint and the embedder both consume.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NormalizedRequest {
    pub endpoint: String,
    pub model: String,
    pub messages: Vec<NormalizedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl NormalizedRequest {
    /// Text representation for the embedder: role-prefixed messages joined
    /// with newlines.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn normalized_message(message: &Message) -> NormalizedMessage {
    NormalizedMessage {
        role: message.role().to_lowercase(),
        content: message.content_text().trim().to_string(),
    }
}

/// Normalize a chat completion request. `stream`, `stream_options`, and
/// `user` are dropped.
pub fn normalize_chat(endpoint: &str, payload: &CreateChatCompletionPayload) -> NormalizedRequest {
    NormalizedRequest {
        endpoint: endpoint.to_string(),
        model: payload.model.clone(),
        messages: payload.messages.iter().map(normalized_message).collect(),
        temperature: payload.temperature,
        top_p: payload.top_p,
        max_tokens: payload.effective_max_tokens(),
        response_format: payload
            .response_format
            .as_ref()
            .and_then(|f| serde_json::to_value(f).ok()),
        tools: payload
            .tools
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok()),
        seed: payload.seed,
    }
}

/// Normalize a legacy text completion request. The prompt becomes a single
/// user message.
pub fn normalize_completion(
    endpoint: &str,
    payload: &CreateCompletionPayload,
) -> NormalizedRequest {
    NormalizedRequest {
        endpoint: endpoint.to_string(),
        model: payload.model.clone(),
        messages: vec![NormalizedMessage {
            role: "user".to_string(),
            content: payload.prompt.as_text().trim().to_string(),
        }],
        temperature: payload.temperature,
        top_p: payload.top_p,
        max_tokens: payload.max_tokens,
        response_format: None,
        tools: None,
        seed: payload.seed,
    }
}

/// Normalize an embedding request.
pub fn normalize_embedding(
    endpoint: &str,
    payload: &CreateEmbeddingPayload,
) -> NormalizedRequest {
    NormalizedRequest {
        endpoint: endpoint.to_string(),
        model: payload.model.clone(),
        messages: vec![NormalizedMessage {
            role: "user".to_string(),
            content: payload.input.as_text().trim().to_string(),
        }],
        temperature: None,
        top_p: None,
        max_tokens: None,
        response_format: None,
        tools: None,
        seed: None,
    }
}

/// Lowercase hex SHA-256 over the canonical JSON of the normalized request.
///
/// Serialization goes through `serde_json::Value`, whose object map is a
/// `BTreeMap`, so keys come out sorted at every nesting level.
pub fn fingerprint(normalized: &NormalizedRequest) -> String {
    let value = serde_json::to_value(normalized)
        .expect("normalized request serializes to JSON");
    let canonical = serde_json::to_vec(&value).expect("JSON value serializes");
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}
