//! Priority-ordered provider key selection with fail-over.
//!
//! Dispatch walks a project's active keys by priority. Auth failures and
//! unavailability fall over to the next key immediately; provider rate
//! limits are honored when `Retry-After` is short, otherwise the router
//! moves on. Once a streaming response has produced its first byte the
//! router never retries.

use std::{collections::HashMap, io, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use serde_json::Value;
use uuid::Uuid;

use super::{
    EndpointKind, ProviderAdapter, StreamTranslator, UpstreamError, default_adapter,
};
use crate::{
    error::GatewayError,
    models::ProviderKind,
    store::GatewayStore,
    streaming::DeadlineStream,
    vault::{SealedKey, Vault},
};

/// Deadline for a non-streaming provider call.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum silence between stream chunks.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum lifetime of one stream.
pub const STREAM_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);
/// A provider `Retry-After` above this triggers fail-over instead of a wait.
const MAX_HONORED_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Canonical SSE frame stream.
pub type CanonicalFrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Body of a successful upstream call.
pub enum UpstreamBody {
    Json(Value),
    Stream(CanonicalFrameStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Json(_) => f.write_str("UpstreamBody::Json"),
            UpstreamBody::Stream(_) => f.write_str("UpstreamBody::Stream"),
        }
    }
}

/// A successful dispatch, attributed to the provider key that won.
#[derive(Debug)]
pub struct UpstreamSuccess {
    pub provider_key_id: Uuid,
    pub provider: ProviderKind,
    pub body: UpstreamBody,
}

pub struct ProviderRouter {
    store: Arc<dyn GatewayStore>,
    vault: Arc<Vault>,
    client: reqwest::Client,
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRouter {
    pub fn new(store: Arc<dyn GatewayStore>, vault: Arc<Vault>, client: reqwest::Client) -> Self {
        let mut adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>> = HashMap::new();
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Groq,
            ProviderKind::OpenRouter,
        ] {
            adapters.insert(kind, Arc::from(default_adapter(kind)));
        }
        Self {
            store,
            vault,
            client,
            adapters,
        }
    }

    /// Replace an adapter, e.g. to point a provider at a test server.
    pub fn with_adapter(mut self, kind: ProviderKind, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    /// Dispatch a request to the given provider using the project's active
    /// keys in priority order.
    pub async fn dispatch(
        &self,
        project_id: Uuid,
        provider: ProviderKind,
        endpoint: EndpointKind,
        payload: &Value,
        stream: bool,
    ) -> Result<UpstreamSuccess, GatewayError> {
        let adapter = self
            .adapters
            .get(&provider)
            .ok_or_else(|| GatewayError::Internal(format!("no adapter for {provider}")))?;

        let keys = self
            .store
            .active_provider_keys(project_id, provider)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if keys.is_empty() {
            tracing::warn!(%project_id, %provider, "no active provider key configured");
            return Err(GatewayError::UpstreamAuth);
        }

        let url = adapter
            .request_url(endpoint)
            .map_err(GatewayError::from)?;
        let mut body = adapter
            .build_request(endpoint, payload)
            .map_err(GatewayError::from)?;
        if endpoint != EndpointKind::Embeddings {
            body["stream"] = Value::Bool(stream);
        }
        // Serialize once, outside the fail-over loop.
        let body_bytes =
            serde_json::to_vec(&body).map_err(|e| GatewayError::Internal(e.to_string()))?;

        let mut last_error = GatewayError::UpstreamUnavailable;
        for key in keys {
            let sealed = SealedKey {
                encrypted_key: key.encrypted_key.clone(),
                iv: key.iv.clone(),
            };
            let api_key = match self.vault.decrypt(&sealed) {
                Ok(k) => k,
                Err(e) => {
                    tracing::error!(key_id = %key.id, error = %e, "provider key failed to decrypt");
                    last_error = GatewayError::Decrypt;
                    continue;
                }
            };

            match self
                .attempt(adapter, &url, &api_key, &body_bytes, endpoint, stream)
                .await
            {
                Ok(body) => {
                    if let Err(e) = self.store.touch_provider_key(key.id).await {
                        tracing::warn!(key_id = %key.id, error = %e, "failed to touch provider key");
                    }
                    return Ok(UpstreamSuccess {
                        provider_key_id: key.id,
                        provider,
                        body,
                    });
                }
                Err(e) if e.is_failover() => {
                    tracing::warn!(
                        key_id = %key.id,
                        priority = key.priority,
                        error = %e,
                        "provider attempt failed; trying next key"
                    );
                    last_error = e.into();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error)
    }

    /// One attempt against one key, with a single short Retry-After wait.
    async fn attempt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        url: &str,
        api_key: &str,
        body_bytes: &[u8],
        endpoint: EndpointKind,
        stream: bool,
    ) -> Result<UpstreamBody, UpstreamError> {
        let mut waited_on_rate_limit = false;
        loop {
            let mut request = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .body(body_bytes.to_vec());
            if !stream {
                request = request.timeout(PROVIDER_TIMEOUT);
            }
            let request = adapter.apply_auth(request, api_key);

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout),
                Err(e) => return Err(UpstreamError::Unavailable(e.to_string())),
            };

            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = response.bytes().await.unwrap_or_default();
                let mut error = adapter.map_error(status, &body);
                if let UpstreamError::RateLimited { retry_after: ra } = &mut error {
                    *ra = retry_after;
                }

                if let UpstreamError::RateLimited {
                    retry_after: Some(wait),
                } = &error
                    && *wait <= MAX_HONORED_RETRY_AFTER
                    && !waited_on_rate_limit
                {
                    tracing::debug!(wait_secs = wait.as_secs(), "honoring provider Retry-After");
                    tokio::time::sleep(*wait).await;
                    waited_on_rate_limit = true;
                    continue;
                }
                return Err(error);
            }

            if stream {
                let byte_stream = response.bytes_stream().map_err(io::Error::other);
                let bounded =
                    DeadlineStream::new(byte_stream, STREAM_IDLE_TIMEOUT, STREAM_TOTAL_TIMEOUT);
                let translated = TranslatedStream::new(bounded, adapter.stream_translator());
                return Ok(UpstreamBody::Stream(Box::pin(translated)));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;
            let canonical = adapter.parse_response(endpoint, &body)?;
            return Ok(UpstreamBody::Json(canonical));
        }
    }
}

/// Applies a [`StreamTranslator`] over a raw provider byte stream.
struct TranslatedStream<S> {
    inner: S,
    translator: Box<dyn StreamTranslator>,
    queue: std::collections::VecDeque<Bytes>,
    done: bool,
}

impl<S> TranslatedStream<S> {
    fn new(inner: S, translator: Box<dyn StreamTranslator>) -> Self {
        Self {
            inner,
            translator,
            queue: std::collections::VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for TranslatedStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let frames = self.translator.push(&bytes);
                    self.queue.extend(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    let frames = self.translator.finish();
                    self.queue.extend(frames);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
