//! The request lifecycle orchestrator.
//!
//! Per request: authenticate → rate/quota → cache lookup → (hit | coalesced
//! upstream call) → client bytes → telemetry. Upstream work for a miss runs
//! in a detached task that feeds the single-flight buffer, so a client
//! disconnect never cancels the tee, the cache insert, or the followers.

use std::{io, sync::Arc, time::Duration};

use axum::{
    Json,
    body::Body,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use uuid::Uuid;
use validator::Validate;

use crate::{
    api_types::{
        ChatCompletion, CreateChatCompletionPayload, CreateCompletionPayload,
        CreateEmbeddingPayload, Usage,
    },
    auth::Admission,
    cache::{
        CacheEngine, CacheLookup, FlightFollower, FlightGuard, FlightJoin, FlightResult,
        HashEmbedder, HttpEmbedder, InsertOutcome, MemoryVectorIndex, NormalizedRequest,
        normalize_chat, normalize_completion, normalize_embedding,
    },
    config::{Config, EmbeddingConfig},
    error::GatewayError,
    limits::{QuotaTracker, RateLimiter},
    models::{ProviderKind, RequestStatus, UsageLogEntry},
    pricing::{PricingCatalog, microcents_to_dollars},
    providers::{EndpointKind, ProviderRouter, UpstreamBody, router::PROVIDER_TIMEOUT},
    store::{GatewayStore, MemoryStore},
    streaming::{SseAccumulator, replay_as_stream},
    telemetry::{MemoryAnalyticsSink, TelemetryEvent, TelemetryQueue},
    vault::Vault,
};

/// How long a follower waits on its leader: the provider deadline plus a
/// coalescing margin.
const FOLLOWER_TIMEOUT: Duration = Duration::from_secs(62);

/// What the `X-Cache` header reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheStatus {
    Exact,
    Semantic(f64),
    Miss,
    Bypass,
}

impl CacheStatus {
    fn header_value(&self) -> &'static str {
        match self {
            CacheStatus::Exact => "EXACT",
            CacheStatus::Semantic(_) => "SEMANTIC",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: Config,
    pub store: Arc<dyn GatewayStore>,
    pub vault: Arc<Vault>,
    pub pricing: Arc<PricingCatalog>,
    pub cache: Arc<CacheEngine>,
    pub router: Arc<ProviderRouter>,
    pub limiter: RateLimiter,
    pub quota: QuotaTracker,
    pub telemetry: Arc<TelemetryQueue>,
    pub analytics: Arc<MemoryAnalyticsSink>,
    pub tracker: TaskTracker,
}

impl std::ops::Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AppState {
    /// Wire up the full state graph from configuration.
    pub fn build(config: Config) -> Result<Self, GatewayError> {
        let vault = Arc::new(
            Vault::new(Some(&config.master_secret))
                .map_err(|e| GatewayError::Config(e.to_string()))?,
        );
        let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let embedder: Arc<dyn crate::cache::Embedder> = match &config.embedding {
            EmbeddingConfig::Http {
                base_url,
                api_key,
                model,
                dimensions,
            } => Arc::new(HttpEmbedder::new(
                client.clone(),
                base_url.clone(),
                api_key.clone(),
                model.clone(),
                *dimensions,
            )),
            EmbeddingConfig::Hashing { dimensions } => Arc::new(HashEmbedder::new(*dimensions)),
        };

        let cache = Arc::new(CacheEngine::new(
            Arc::new(MemoryVectorIndex::new()),
            embedder,
            config.cache_enabled,
        ));
        let router = Arc::new(ProviderRouter::new(
            store.clone(),
            vault.clone(),
            client.clone(),
        ));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                vault,
                pricing: Arc::new(PricingCatalog::with_defaults()),
                cache,
                router,
                limiter: RateLimiter::new(),
                quota: QuotaTracker::new(),
                telemetry: Arc::new(TelemetryQueue::default()),
                analytics: Arc::new(MemoryAnalyticsSink::new()),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// State with swapped-in parts, for tests.
    pub fn from_parts(inner: AppStateInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

/// Route a model name to its provider. `provider/model` prefixes win;
/// otherwise Claude models go to Anthropic and everything else to OpenAI.
pub fn resolve_provider(model: &str) -> (ProviderKind, String) {
    if let Some((prefix, rest)) = model.split_once('/')
        && let Some(kind) = ProviderKind::parse(prefix)
    {
        return (kind, rest.to_string());
    }
    if model.starts_with("claude") {
        (ProviderKind::Anthropic, model.to_string())
    } else {
        (ProviderKind::OpenAi, model.to_string())
    }
}

fn usage_from_value(value: &Value) -> Option<Usage> {
    serde_json::from_value(value.get("usage")?.clone()).ok()
}

fn apply_cache_headers(response: &mut Response, admission: &Admission, status: CacheStatus) {
    admission.apply_headers(response.headers_mut());
    response
        .headers_mut()
        .insert("X-Cache", HeaderValue::from_static(status.header_value()));
    let similarity = match status {
        CacheStatus::Exact => Some(1.0),
        CacheStatus::Semantic(s) => Some(s),
        CacheStatus::Miss | CacheStatus::Bypass => None,
    };
    if let Some(similarity) = similarity
        && let Ok(v) = HeaderValue::try_from(format!("{similarity:.4}"))
    {
        response.headers_mut().insert("X-Cache-Similarity", v);
    }
}

fn sse_response(stream: impl futures_util::Stream<Item = Result<bytes::Bytes, io::Error>> + Send + 'static) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Stream a follower's frame buffer out as SSE.
fn follower_stream(
    follower: FlightFollower,
) -> impl futures_util::Stream<Item = Result<bytes::Bytes, io::Error>> + Send {
    futures_util::stream::unfold(
        (follower, 0usize, false),
        |(follower, cursor, done)| async move {
            if done {
                return None;
            }
            match follower.next_frame(cursor, FOLLOWER_TIMEOUT).await {
                Ok(Some((frame, next))) => Some((Ok(frame), (follower, next, false))),
                Ok(None) => None,
                Err(outcome) => {
                    tracing::warn!(?outcome, "follower stream ended abnormally");
                    Some((
                        Err(io::Error::new(io::ErrorKind::TimedOut, "upstream ended")),
                        (follower, cursor, true),
                    ))
                }
            }
        },
    )
}

struct RequestContext {
    project_id: Uuid,
    gateway_key_id: Uuid,
    endpoint: EndpointKind,
    provider: ProviderKind,
    model: String,
    started: std::time::Instant,
}

impl AppState {
    /// Append a usage log row and the matching telemetry event. Both are
    /// fire-and-forget: the client response never waits on them.
    fn record_usage(
        &self,
        ctx: &RequestContext,
        usage: Option<&Usage>,
        cost_microcents: Option<i64>,
        cached: bool,
        similarity: Option<f64>,
        status: RequestStatus,
        error_code: Option<String>,
    ) {
        let tokens_input = usage.map(|u| u.prompt_tokens).unwrap_or(0);
        let tokens_output = usage.map(|u| u.completion_tokens).unwrap_or(0);
        let latency_ms = ctx.started.elapsed().as_millis() as i64;

        let entry = UsageLogEntry {
            id: Uuid::new_v4(),
            project_id: ctx.project_id,
            gateway_key_id: ctx.gateway_key_id,
            provider: ctx.provider.as_str().to_string(),
            model: ctx.model.clone(),
            tokens_input,
            tokens_output,
            tokens_total: tokens_input + tokens_output,
            cost_microcents,
            cached,
            cache_similarity: similarity,
            latency_ms,
            endpoint_path: ctx.endpoint.path().to_string(),
            status,
            error_code: error_code.clone(),
            created_at: Utc::now(),
        };

        let event = TelemetryEvent::prompt_call(
            ctx.project_id,
            entry.id.to_string(),
            self.config.env,
            ctx.model.clone(),
            Some(ctx.provider.as_str().to_string()),
            tokens_input,
            tokens_output,
            cost_microcents.map(microcents_to_dollars),
            latency_ms,
            status.as_str().to_string(),
            cached,
            similarity,
        );
        self.telemetry.enqueue(event);

        let store = self.store.clone();
        self.tracker.spawn(async move {
            if let Err(e) = store.insert_usage_log(entry).await {
                tracing::warn!(error = %e, "failed to append usage log");
            }
        });
    }

    // ── Endpoint entry points ───────────────────────────────────────────

    pub async fn chat_completion(
        &self,
        admission: Admission,
        payload: CreateChatCompletionPayload,
    ) -> Response {
        if let Err(e) = payload.validate() {
            return GatewayError::BadRequest(e.to_string()).into_response();
        }
        let (provider, upstream_model) = resolve_provider(&payload.model);
        let mut upstream_payload = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => return GatewayError::Internal(e.to_string()).into_response(),
        };
        upstream_payload["model"] = Value::String(upstream_model);

        let norm = normalize_chat(EndpointKind::ChatCompletions.path(), &payload);
        let ctx = RequestContext {
            project_id: admission.project.id,
            gateway_key_id: admission.gateway_key.id,
            endpoint: EndpointKind::ChatCompletions,
            provider,
            model: payload.model.clone(),
            started: std::time::Instant::now(),
        };
        self.run_lifecycle(admission, ctx, norm, upstream_payload, payload.stream, true)
            .await
    }

    pub async fn completion(
        &self,
        admission: Admission,
        payload: CreateCompletionPayload,
    ) -> Response {
        if let Err(e) = payload.validate() {
            return GatewayError::BadRequest(e.to_string()).into_response();
        }
        let (provider, upstream_model) = resolve_provider(&payload.model);
        let mut upstream_payload = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => return GatewayError::Internal(e.to_string()).into_response(),
        };
        upstream_payload["model"] = Value::String(upstream_model);

        let norm = normalize_completion(EndpointKind::Completions.path(), &payload);
        let ctx = RequestContext {
            project_id: admission.project.id,
            gateway_key_id: admission.gateway_key.id,
            endpoint: EndpointKind::Completions,
            provider,
            model: payload.model.clone(),
            started: std::time::Instant::now(),
        };

        if payload.stream {
            // Legacy completion streams use a chunk schema the bridge does
            // not buffer; they pass through uncached.
            return self
                .dispatch_bypass(admission, ctx, upstream_payload, true)
                .await;
        }
        self.run_lifecycle(admission, ctx, norm, upstream_payload, false, true)
            .await
    }

    pub async fn embedding(
        &self,
        admission: Admission,
        payload: CreateEmbeddingPayload,
    ) -> Response {
        if let Err(e) = payload.validate() {
            return GatewayError::BadRequest(e.to_string()).into_response();
        }
        let (provider, upstream_model) = resolve_provider(&payload.model);
        let mut upstream_payload = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => return GatewayError::Internal(e.to_string()).into_response(),
        };
        upstream_payload["model"] = Value::String(upstream_model);

        let norm = normalize_embedding(EndpointKind::Embeddings.path(), &payload);
        let ctx = RequestContext {
            project_id: admission.project.id,
            gateway_key_id: admission.gateway_key.id,
            endpoint: EndpointKind::Embeddings,
            provider,
            model: payload.model.clone(),
            started: std::time::Instant::now(),
        };
        // Embedding vectors embed nothing themselves; lookups are
        // fingerprint-exact only.
        self.run_lifecycle(admission, ctx, norm, upstream_payload, false, false)
            .await
    }

    // ── Lifecycle core ──────────────────────────────────────────────────

    async fn run_lifecycle(
        &self,
        admission: Admission,
        ctx: RequestContext,
        norm: NormalizedRequest,
        upstream_payload: Value,
        stream: bool,
        semantic: bool,
    ) -> Response {
        let (fingerprint, lookup) = self.cache.lookup(&admission.project, &norm, semantic).await;

        match lookup {
            CacheLookup::Exact(entry) => {
                self.serve_hit(&admission, &ctx, entry.canonical_response, CacheStatus::Exact, stream, entry.prompt_tokens, entry.completion_tokens)
            }
            CacheLookup::Semantic { entry, similarity } => self.serve_hit(
                &admission,
                &ctx,
                entry.canonical_response,
                CacheStatus::Semantic(similarity),
                stream,
                entry.prompt_tokens,
                entry.completion_tokens,
            ),
            CacheLookup::Bypass => self.dispatch_bypass(admission, ctx, upstream_payload, stream).await,
            CacheLookup::Miss => {
                match self.cache.join_flight(admission.project.id, &fingerprint) {
                    FlightJoin::Leader(guard) => {
                        let follower = guard.follower();
                        self.spawn_leader(
                            admission.project.clone(),
                            norm,
                            fingerprint,
                            guard,
                            upstream_payload,
                            stream,
                            RequestContext {
                                started: ctx.started,
                                model: ctx.model.clone(),
                                ..ctx
                            },
                        );
                        self.serve_from_flight(&admission, &ctx, follower, stream, false)
                            .await
                    }
                    FlightJoin::Follower(follower) => {
                        self.serve_as_follower(admission, ctx, norm, upstream_payload, stream, semantic, follower)
                            .await
                    }
                }
            }
        }
    }

    /// Serve a cache hit. First byte reaches the client before any
    /// telemetry write returns; usage recording is fire-and-forget.
    fn serve_hit(
        &self,
        admission: &Admission,
        ctx: &RequestContext,
        canonical: Value,
        status: CacheStatus,
        stream: bool,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Response {
        let similarity = match status {
            CacheStatus::Exact => Some(1.0),
            CacheStatus::Semantic(s) => Some(s),
            _ => None,
        };
        let usage = Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        };
        // Cached calls cost nothing upstream.
        self.record_usage(
            ctx,
            Some(&usage),
            Some(0),
            true,
            similarity,
            RequestStatus::Success,
            None,
        );

        let mut response = if stream {
            match serde_json::from_value::<ChatCompletion>(canonical) {
                Ok(completion) => sse_response(replay_as_stream(
                    &completion,
                    Duration::from_millis(self.config.replay_delay_ms),
                )),
                Err(e) => {
                    return GatewayError::Internal(format!("cached entry unreadable: {e}"))
                        .into_response();
                }
            }
        } else {
            Json(canonical).into_response()
        };
        apply_cache_headers(&mut response, admission, status);
        response
    }

    /// Cache disabled or endpoint not cacheable: straight upstream.
    async fn dispatch_bypass(
        &self,
        admission: Admission,
        ctx: RequestContext,
        upstream_payload: Value,
        stream: bool,
    ) -> Response {
        let dispatched = self
            .router
            .dispatch(
                ctx.project_id,
                ctx.provider,
                ctx.endpoint,
                &upstream_payload,
                stream,
            )
            .await;

        match dispatched {
            Err(e) => {
                self.record_usage(
                    &ctx,
                    None,
                    None,
                    false,
                    None,
                    error_status(&e),
                    Some(e.code().to_string()),
                );
                e.into_response()
            }
            Ok(success) => match success.body {
                UpstreamBody::Json(value) => {
                    let usage = usage_from_value(&value);
                    let cost = usage.as_ref().and_then(|u| {
                        self.pricing.cost_microcents(
                            ctx.provider,
                            &ctx.model,
                            u.prompt_tokens,
                            u.completion_tokens,
                        )
                    });
                    self.record_usage(
                        &ctx,
                        usage.as_ref(),
                        cost,
                        false,
                        None,
                        RequestStatus::Success,
                        None,
                    );
                    let mut response = Json(value).into_response();
                    apply_cache_headers(&mut response, &admission, CacheStatus::Bypass);
                    response
                }
                UpstreamBody::Stream(frames) => {
                    self.record_usage(
                        &ctx,
                        None,
                        None,
                        false,
                        None,
                        RequestStatus::Success,
                        None,
                    );
                    let mut response = sse_response(frames);
                    apply_cache_headers(&mut response, &admission, CacheStatus::Bypass);
                    response
                }
            },
        }
    }

    /// Spawn the detached upstream producer for a missed fingerprint.
    ///
    /// The producer owns the flight guard: it pushes frames for followers,
    /// publishes the terminal result, performs the best-effort cache insert,
    /// and records the upstream usage for the leader request. Detachment is
    /// what lets a disconnected client's work complete for the next caller.
    #[allow(clippy::too_many_arguments)]
    fn spawn_leader(
        &self,
        project: crate::models::Project,
        norm: NormalizedRequest,
        fingerprint: String,
        guard: FlightGuard,
        upstream_payload: Value,
        stream: bool,
        ctx: RequestContext,
    ) {
        let state = self.clone();
        self.tracker.spawn(async move {
            state
                .run_upstream(project, norm, fingerprint, guard, upstream_payload, stream, ctx)
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_upstream(
        &self,
        project: crate::models::Project,
        norm: NormalizedRequest,
        fingerprint: String,
        guard: FlightGuard,
        upstream_payload: Value,
        stream: bool,
        ctx: RequestContext,
    ) {
        let dispatched = self
            .router
            .dispatch(ctx.project_id, ctx.provider, ctx.endpoint, &upstream_payload, stream)
            .await;

        let success = match dispatched {
            Ok(s) => s,
            Err(e) => {
                self.record_usage(
                    &ctx,
                    None,
                    None,
                    false,
                    None,
                    error_status(&e),
                    Some(e.code().to_string()),
                );
                guard.fail(e.code());
                return;
            }
        };

        match success.body {
            UpstreamBody::Json(canonical) => {
                let usage = usage_from_value(&canonical);
                let cost = usage.as_ref().and_then(|u| {
                    self.pricing.cost_microcents(
                        ctx.provider,
                        &ctx.model,
                        u.prompt_tokens,
                        u.completion_tokens,
                    )
                });
                guard.complete(FlightResult {
                    canonical_response: canonical.clone(),
                    usage: usage.clone(),
                    provider: ctx.provider.as_str().to_string(),
                    model: ctx.model.clone(),
                });
                self.insert_cache_entry(&project, &norm, fingerprint, canonical, usage.clone(), cost)
                    .await;
                self.record_usage(
                    &ctx,
                    usage.as_ref(),
                    cost,
                    false,
                    None,
                    RequestStatus::Success,
                    None,
                );
            }
            UpstreamBody::Stream(mut frames) => {
                let mut acc = SseAccumulator::new();
                let mut stream_error = false;
                while let Some(item) = frames.next().await {
                    match item {
                        Ok(bytes) => {
                            acc.push_bytes(&bytes);
                            guard.push_frame(bytes);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "upstream stream failed mid-flight");
                            stream_error = true;
                            break;
                        }
                    }
                }

                if stream_error {
                    self.record_usage(
                        &ctx,
                        None,
                        None,
                        false,
                        None,
                        RequestStatus::Error,
                        Some("upstream_stream_error".to_string()),
                    );
                    guard.fail("upstream_stream_error");
                    return;
                }

                match acc.finish() {
                    Some(completion) => {
                        let usage = completion.usage.clone();
                        let cost = usage.as_ref().and_then(|u| {
                            self.pricing.cost_microcents(
                                ctx.provider,
                                &ctx.model,
                                u.prompt_tokens,
                                u.completion_tokens,
                            )
                        });
                        let canonical = match serde_json::to_value(&completion) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(error = %e, "canonical completion failed to serialize");
                                guard.fail("internal");
                                return;
                            }
                        };
                        guard.complete(FlightResult {
                            canonical_response: canonical.clone(),
                            usage: usage.clone(),
                            provider: ctx.provider.as_str().to_string(),
                            model: ctx.model.clone(),
                        });
                        self.insert_cache_entry(&project, &norm, fingerprint, canonical, usage.clone(), cost)
                            .await;
                        self.record_usage(
                            &ctx,
                            usage.as_ref(),
                            cost,
                            false,
                            None,
                            RequestStatus::Success,
                            None,
                        );
                    }
                    None => {
                        // Partial streams are surfaced but never cached.
                        self.record_usage(
                            &ctx,
                            None,
                            None,
                            false,
                            None,
                            RequestStatus::Error,
                            Some("upstream_incomplete".to_string()),
                        );
                        guard.fail("upstream_incomplete");
                    }
                }
            }
        }
    }

    /// Best-effort cache insert; failures degrade to a log line.
    async fn insert_cache_entry(
        &self,
        project: &crate::models::Project,
        norm: &NormalizedRequest,
        fingerprint: String,
        canonical: Value,
        usage: Option<Usage>,
        cost_microcents: Option<i64>,
    ) {
        let body_len = canonical.to_string().len();
        if body_len > self.config.max_inline_body_bytes {
            tracing::debug!(
                bytes = body_len,
                cap = self.config.max_inline_body_bytes,
                "response exceeds inline cache cap; not cached"
            );
            return;
        }
        let outcome = InsertOutcome {
            canonical_response: canonical,
            provider: resolve_provider(&norm.model).0.as_str().to_string(),
            model: norm.model.clone(),
            usage,
            cost_microcents,
        };
        if let Err(e) = self.cache.insert(project, norm, fingerprint, outcome).await {
            tracing::warn!(error = %e, "cache insert failed");
        }
    }

    /// Serve a response from a flight's shared buffer.
    async fn serve_from_flight(
        &self,
        admission: &Admission,
        ctx: &RequestContext,
        follower: FlightFollower,
        stream: bool,
        log_usage: bool,
    ) -> Response {
        if stream {
            if log_usage {
                // Follower accounting lands when the leader publishes.
                let state = self.clone();
                let wait_follower = follower.clone();
                let ctx_copy = RequestContext {
                    started: ctx.started,
                    model: ctx.model.clone(),
                    ..*ctx
                };
                self.tracker.spawn(async move {
                    if let crate::cache::FollowerOutcome::Ready(result) =
                        wait_follower.wait(FOLLOWER_TIMEOUT).await
                    {
                        state.record_usage(
                            &ctx_copy,
                            result.usage.as_ref(),
                            Some(0),
                            false,
                            None,
                            RequestStatus::Success,
                            None,
                        );
                    }
                });
            }
            let mut response = sse_response(follower_stream(follower));
            apply_cache_headers(&mut response, admission, CacheStatus::Miss);
            return response;
        }

        match follower.wait(FOLLOWER_TIMEOUT).await {
            crate::cache::FollowerOutcome::Ready(result) => {
                if log_usage {
                    self.record_usage(
                        ctx,
                        result.usage.as_ref(),
                        Some(0),
                        false,
                        None,
                        RequestStatus::Success,
                        None,
                    );
                }
                let mut response = Json(result.canonical_response.clone()).into_response();
                apply_cache_headers(&mut response, admission, CacheStatus::Miss);
                response
            }
            crate::cache::FollowerOutcome::Failed(code) => {
                let error = error_from_flight_code(&code);
                if log_usage {
                    self.record_usage(
                        ctx,
                        None,
                        None,
                        false,
                        None,
                        error_status(&error),
                        Some(code),
                    );
                }
                error.into_response()
            }
            crate::cache::FollowerOutcome::TimedOut => {
                GatewayError::UpstreamTimeout.into_response()
            }
        }
    }

    /// A follower waits out the leader; if the wait times out or the window
    /// was evicted, it re-enters the lookup once and then goes upstream
    /// itself, uncoalesced.
    #[allow(clippy::too_many_arguments)]
    async fn serve_as_follower(
        &self,
        admission: Admission,
        ctx: RequestContext,
        norm: NormalizedRequest,
        upstream_payload: Value,
        stream: bool,
        semantic: bool,
        follower: FlightFollower,
    ) -> Response {
        if stream {
            let mut response = sse_response(follower_stream(follower.clone()));
            apply_cache_headers(&mut response, &admission, CacheStatus::Miss);

            let state = self.clone();
            self.tracker.spawn(async move {
                if let crate::cache::FollowerOutcome::Ready(result) =
                    follower.wait(FOLLOWER_TIMEOUT).await
                {
                    state.record_usage(
                        &ctx,
                        result.usage.as_ref(),
                        Some(0),
                        false,
                        None,
                        RequestStatus::Success,
                        None,
                    );
                }
            });
            return response;
        }

        match follower.wait(FOLLOWER_TIMEOUT).await {
            crate::cache::FollowerOutcome::Ready(result) => {
                self.record_usage(
                    &ctx,
                    result.usage.as_ref(),
                    Some(0),
                    false,
                    None,
                    RequestStatus::Success,
                    None,
                );
                let mut response = Json(result.canonical_response.clone()).into_response();
                apply_cache_headers(&mut response, &admission, CacheStatus::Miss);
                response
            }
            crate::cache::FollowerOutcome::Failed(code) => {
                let error = error_from_flight_code(&code);
                self.record_usage(
                    &ctx,
                    None,
                    None,
                    false,
                    None,
                    error_status(&error),
                    Some(code),
                );
                error.into_response()
            }
            crate::cache::FollowerOutcome::TimedOut => {
                // Re-enter the lookup once; the leader may have landed an
                // entry, otherwise this request goes upstream alone.
                let (fingerprint, lookup) =
                    self.cache.lookup(&admission.project, &norm, semantic).await;
                match lookup {
                    CacheLookup::Exact(entry) => self.serve_hit(
                        &admission,
                        &ctx,
                        entry.canonical_response,
                        CacheStatus::Exact,
                        stream,
                        entry.prompt_tokens,
                        entry.completion_tokens,
                    ),
                    CacheLookup::Semantic { entry, similarity } => self.serve_hit(
                        &admission,
                        &ctx,
                        entry.canonical_response,
                        CacheStatus::Semantic(similarity),
                        stream,
                        entry.prompt_tokens,
                        entry.completion_tokens,
                    ),
                    _ => {
                        let guard = self.cache.flights().solo();
                        let solo_follower = guard.follower();
                        self.spawn_leader(
                            admission.project.clone(),
                            norm,
                            fingerprint,
                            guard,
                            upstream_payload,
                            stream,
                            RequestContext {
                                started: ctx.started,
                                model: ctx.model.clone(),
                                ..ctx
                            },
                        );
                        self.serve_from_flight(&admission, &ctx, solo_follower, stream, false)
                            .await
                    }
                }
            }
        }
    }
}

fn error_status(error: &GatewayError) -> RequestStatus {
    match error {
        GatewayError::UpstreamTimeout => RequestStatus::Timeout,
        _ => RequestStatus::Error,
    }
}

fn error_from_flight_code(code: &str) -> GatewayError {
    match code {
        "upstream_timeout" => GatewayError::UpstreamTimeout,
        "upstream_auth_failed" => GatewayError::UpstreamAuth,
        "bad_request" => GatewayError::BadRequest("request rejected upstream".to_string()),
        _ => GatewayError::UpstreamUnavailable,
    }
}

/// Follower wait ceiling, derived from the provider deadline.
pub fn follower_timeout() -> Duration {
    PROVIDER_TIMEOUT + Duration::from_secs(2)
}
