use serde::{Deserialize, Serialize};
use validator::Validate;

use super::chat_completion::{FinishReason, Stop, Usage};

/// Prompt for a legacy text completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CompletionPrompt {
    Text(String),
    TextArray(Vec<String>),
}

impl CompletionPrompt {
    pub fn as_text(&self) -> String {
        match self {
            CompletionPrompt::Text(t) => t.clone(),
            CompletionPrompt::TextArray(parts) => parts.join("\n"),
        }
    }
}

/// Create text completion request (OpenAI-compatible)
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateCompletionPayload {
    pub model: String,

    pub prompt: CompletionPrompt,

    #[validate(range(min = 1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    #[validate(range(min = 0.0, max = 2.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Stop>,

    #[serde(default)]
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// One text completion choice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: Option<FinishReason>,
}

/// Legacy text completion response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_variants_flatten() {
        assert_eq!(CompletionPrompt::Text("one".into()).as_text(), "one");
        assert_eq!(
            CompletionPrompt::TextArray(vec!["a".into(), "b".into()]).as_text(),
            "a\nb"
        );
    }

    #[test]
    fn payload_deserializes_string_or_array_prompt() {
        let p: CreateCompletionPayload =
            serde_json::from_str(r#"{"model":"m-1","prompt":"hello"}"#).unwrap();
        assert_eq!(p.prompt.as_text(), "hello");
        assert!(!p.stream);

        let p: CreateCompletionPayload =
            serde_json::from_str(r#"{"model":"m-1","prompt":["a","b"],"stream":true}"#).unwrap();
        assert_eq!(p.prompt.as_text(), "a\nb");
        assert!(p.stream);
    }
}
