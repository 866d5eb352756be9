//! OpenAI-compatible provider adapter.
//!
//! Serves OpenAI itself plus the providers that speak its wire format
//! (Groq, OpenRouter); only the base URL differs. Requests and responses
//! pass through unchanged, and streams arrive already in the canonical
//! chunk schema.

use bytes::Bytes;
use http::StatusCode;

use super::{
    EndpointKind, ProviderAdapter, StreamTranslator, UpstreamError, classify_status,
};
use crate::models::ProviderKind;

pub struct OpenAiCompatibleAdapter {
    kind: ProviderKind,
    base_url: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(kind: ProviderKind, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
        }
    }
}

impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn request_url(&self, endpoint: EndpointKind) -> Result<String, UpstreamError> {
        Ok(format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            endpoint.path()
        ))
    }

    fn build_request(
        &self,
        _endpoint: EndpointKind,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        Ok(payload.clone())
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        request.bearer_auth(api_key)
    }

    fn parse_response(
        &self,
        _endpoint: EndpointKind,
        body: &[u8],
    ) -> Result<serde_json::Value, UpstreamError> {
        serde_json::from_slice(body).map_err(|e| UpstreamError::Schema(e.to_string()))
    }

    fn stream_translator(&self) -> Box<dyn StreamTranslator> {
        Box::new(PassthroughTranslator)
    }

    fn map_error(&self, status: StatusCode, body: &[u8]) -> UpstreamError {
        let retry_after = None;
        let classified = classify_status(status, retry_after);
        if matches!(classified, UpstreamError::BadRequest(_)) {
            // Prefer the provider's own message when it parses, but never
            // forward it verbatim past the schema check.
            let message = serde_json::from_slice::<serde_json::Value>(body)
                .ok()
                .and_then(|v| {
                    v.get("error")?
                        .get("message")?
                        .as_str()
                        .map(|s| s.chars().take(200).collect::<String>())
                })
                .unwrap_or_else(|| format!("provider rejected the request ({status})"));
            return UpstreamError::BadRequest(message);
        }
        classified
    }
}

/// OpenAI-format streams are already canonical; frames pass through as-is.
struct PassthroughTranslator;

impl StreamTranslator for PassthroughTranslator {
    fn push(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(bytes)]
    }

    fn finish(&mut self) -> Vec<Bytes> {
        Vec::new()
    }
}
