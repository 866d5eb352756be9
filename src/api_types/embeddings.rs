use serde::{Deserialize, Serialize};
use validator::Validate;

use super::chat_completion::Usage;

/// Embedding input (text or array of texts)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Text(String),
    TextArray(Vec<String>),
}

impl EmbeddingInput {
    pub fn as_text(&self) -> String {
        match self {
            EmbeddingInput::Text(t) => t.clone(),
            EmbeddingInput::TextArray(parts) => parts.join("\n"),
        }
    }
}

/// Encoding format for embeddings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncodingFormat {
    Float,
    Base64,
}

/// Create embedding request (OpenAI-compatible)
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateEmbeddingPayload {
    pub input: EmbeddingInput,

    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<EncodingFormat>,

    #[validate(range(min = 1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// One embedding vector in a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingObject {
    pub object: String,
    pub index: u32,
    pub embedding: Vec<f32>,
}

/// Embedding response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateEmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingObject>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}
