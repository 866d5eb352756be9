//! Anthropic provider adapter.
//!
//! Translates between the gateway's OpenAI-compatible schema and the
//! Anthropic Messages API: requests are rebuilt, responses and stream
//! events are normalized back into the canonical chunk schema.

use bytes::Bytes;
use chrono::Utc;
use http::StatusCode;
use serde_json::{Value, json};

use super::{
    EndpointKind, ProviderAdapter, StreamTranslator, UpstreamError, classify_status,
};
use crate::models::ProviderKind;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic requires max_tokens; applied when the client omits it.
const DEFAULT_MAX_TOKENS: u64 = 1024;

pub struct AnthropicAdapter {
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

fn map_stop_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        // end_turn, stop_sequence
        _ => "stop",
    }
}

/// Flatten an OpenAI message content value (string or parts) to text.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn request_url(&self, endpoint: EndpointKind) -> Result<String, UpstreamError> {
        match endpoint {
            EndpointKind::ChatCompletions => Ok(format!(
                "{}/v1/messages",
                self.base_url.trim_end_matches('/')
            )),
            EndpointKind::Completions | EndpointKind::Embeddings => Err(
                UpstreamError::Unsupported(
                    "anthropic serves chat completions only".to_string(),
                ),
            ),
        }
    }

    fn build_request(
        &self,
        endpoint: EndpointKind,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        if endpoint != EndpointKind::ChatCompletions {
            return Err(UpstreamError::Unsupported(
                "anthropic serves chat completions only".to_string(),
            ));
        }

        let messages = payload
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| UpstreamError::BadRequest("messages array required".to_string()))?;

        // System messages lift into the top-level `system` field; everything
        // else maps onto alternating user/assistant turns.
        let mut system_parts = Vec::new();
        let mut turns = Vec::new();
        for message in messages {
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
            let text = message
                .get("content")
                .map(content_text)
                .unwrap_or_default();
            match role {
                "system" => system_parts.push(text),
                "assistant" => turns.push(json!({"role": "assistant", "content": text})),
                _ => turns.push(json!({"role": "user", "content": text})),
            }
        }

        let mut request = json!({
            "model": payload.get("model").cloned().unwrap_or(Value::Null),
            "max_tokens": payload
                .get("max_completion_tokens")
                .or_else(|| payload.get("max_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
        });
        if !system_parts.is_empty() {
            request["system"] = Value::String(system_parts.join("\n"));
        }
        for field in ["temperature", "top_p"] {
            if let Some(v) = payload.get(field) {
                request[field] = v.clone();
            }
        }
        if let Some(stop) = payload.get("stop") {
            request["stop_sequences"] = match stop {
                Value::String(s) => json!([s]),
                other => other.clone(),
            };
        }
        if payload.get("stream").and_then(|s| s.as_bool()).unwrap_or(false) {
            request["stream"] = Value::Bool(true);
        }
        Ok(request)
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        request
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn parse_response(
        &self,
        _endpoint: EndpointKind,
        body: &[u8],
    ) -> Result<Value, UpstreamError> {
        let response: Value =
            serde_json::from_slice(body).map_err(|e| UpstreamError::Schema(e.to_string()))?;

        let text = response
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .concat()
            })
            .ok_or_else(|| UpstreamError::Schema("missing content blocks".to_string()))?;

        let stop_reason = response
            .get("stop_reason")
            .and_then(|s| s.as_str())
            .map(map_stop_reason);
        let input_tokens = response
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let output_tokens = response
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(json!({
            "id": response.get("id").cloned().unwrap_or(Value::Null),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": response.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": stop_reason,
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            },
        }))
    }

    fn stream_translator(&self) -> Box<dyn StreamTranslator> {
        Box::new(AnthropicStreamTranslator::default())
    }

    fn map_error(&self, status: StatusCode, body: &[u8]) -> UpstreamError {
        let classified = classify_status(status, None);
        if matches!(classified, UpstreamError::BadRequest(_)) {
            let message = serde_json::from_slice::<Value>(body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")?
                        .as_str()
                        .map(|s| s.chars().take(200).collect::<String>())
                })
                .unwrap_or_else(|| format!("provider rejected the request ({status})"));
            return UpstreamError::BadRequest(message);
        }
        classified
    }
}

/// Translates the Anthropic event stream into canonical chunks.
///
/// Event sequence: `message_start` (id, model, input tokens) →
/// `content_block_delta`* (text) → `message_delta` (stop reason, output
/// tokens) → `message_stop`.
#[derive(Default)]
struct AnthropicStreamTranslator {
    buf: String,
    id: String,
    model: String,
    created: i64,
    input_tokens: i64,
    output_tokens: i64,
    finish_reason: Option<String>,
    started: bool,
    finished: bool,
}

impl AnthropicStreamTranslator {
    fn chunk_frame(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Bytes {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        Bytes::from(format!("data: {}\n\n", chunk))
    }

    fn handle_event(&mut self, data: &Value, out: &mut Vec<Bytes>) {
        match data.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(message) = data.get("message") {
                    self.id = message
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.model = message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.input_tokens = message
                        .pointer("/usage/input_tokens")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                }
                self.created = Utc::now().timestamp();
                self.started = true;
                out.push(self.chunk_frame(json!({"role": "assistant"}), None, None));
            }
            Some("content_block_delta") => {
                if let Some(text) = data.pointer("/delta/text").and_then(|t| t.as_str()) {
                    out.push(self.chunk_frame(json!({"content": text}), None, None));
                }
            }
            Some("message_delta") => {
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(|s| s.as_str()) {
                    self.finish_reason = Some(map_stop_reason(reason).to_string());
                }
                if let Some(tokens) = data.pointer("/usage/output_tokens").and_then(|v| v.as_i64())
                {
                    self.output_tokens = tokens;
                }
            }
            Some("message_stop") => {
                self.emit_tail(out);
            }
            _ => {}
        }
    }

    fn emit_tail(&mut self, out: &mut Vec<Bytes>) {
        if self.finished || !self.started {
            return;
        }
        self.finished = true;
        let usage = json!({
            "prompt_tokens": self.input_tokens,
            "completion_tokens": self.output_tokens,
            "total_tokens": self.input_tokens + self.output_tokens,
        });
        let finish = self.finish_reason.clone().unwrap_or_else(|| "stop".to_string());
        out.push(self.chunk_frame(json!({}), Some(&finish), Some(usage)));
        out.push(Bytes::from_static(b"data: [DONE]\n\n"));
    }
}

impl StreamTranslator for AnthropicStreamTranslator {
    fn push(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let Ok(text) = std::str::from_utf8(bytes) else {
            return out;
        };
        self.buf.push_str(text);

        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:")
                && let Ok(value) = serde_json::from_str::<Value>(data.trim_start())
            {
                self.handle_event(&value, &mut out);
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<Bytes> {
        // A stream that ends without message_stop still closes the client
        // stream, but only when a stop reason was seen; otherwise the
        // output stays non-terminal and is never cached.
        let mut out = Vec::new();
        if self.finish_reason.is_some() {
            self.emit_tail(&mut out);
        }
        out
    }
}
