//! End-to-end gateway scenarios exercised through the HTTP router against a
//! mock provider.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

use crate::{
    auth::hash_secret,
    cache::{CacheEngine, HashEmbedder, MemoryVectorIndex},
    config::Config,
    gateway::{AppState, AppStateInner},
    limits::{QuotaTracker, RateLimiter},
    models::{CacheTtl, Plan, Project, ProviderKind},
    pricing::PricingCatalog,
    providers::{OpenAiCompatibleAdapter, ProviderRouter},
    store::{GatewayStore, MemoryStore, NewProviderKey},
    telemetry::{MemoryAnalyticsSink, TelemetryQueue},
    vault::Vault,
};

struct Harness {
    app: Router,
    state: AppState,
    secret: String,
    project_id: Uuid,
}

async fn harness(server: &MockServer, plan: Plan, threshold: f64) -> Harness {
    let config = Config::for_tests();
    let vault = Arc::new(Vault::new(Some(&config.master_secret)).unwrap());
    let store_impl = Arc::new(MemoryStore::new());
    let store: Arc<dyn GatewayStore> = store_impl.clone();

    let tenant = store.create_tenant(plan).await.unwrap();
    let project = store
        .create_project(Project {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            semantic_cache_threshold: threshold,
            cache_ttl: CacheTtl::Seconds(3600),
            cache_ttl_overrides: HashMap::new(),
            cost_alert_threshold: None,
            cost_alerts_enabled: false,
        })
        .await
        .unwrap();

    let secret = format!("gw_{}", Uuid::new_v4().simple());
    store
        .create_gateway_key(project.id, hash_secret(&secret))
        .await
        .unwrap();

    let sealed = vault.encrypt("sk-upstream-primary").unwrap();
    store
        .save_provider_key(NewProviderKey {
            project_id: project.id,
            provider: ProviderKind::OpenAi,
            encrypted_key: sealed.encrypted_key,
            iv: sealed.iv,
            name: "primary".to_string(),
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let router = ProviderRouter::new(store.clone(), vault.clone(), client).with_adapter(
        ProviderKind::OpenAi,
        Arc::new(OpenAiCompatibleAdapter::new(
            ProviderKind::OpenAi,
            server.uri(),
        )),
    );
    let cache = Arc::new(CacheEngine::new(
        Arc::new(MemoryVectorIndex::new()),
        Arc::new(HashEmbedder::new(256)),
        true,
    ));

    let state = AppState::from_parts(AppStateInner {
        config,
        store,
        vault,
        pricing: Arc::new(PricingCatalog::with_defaults()),
        cache,
        router: Arc::new(router),
        limiter: RateLimiter::new(),
        quota: QuotaTracker::new(),
        telemetry: Arc::new(TelemetryQueue::default()),
        analytics: Arc::new(MemoryAnalyticsSink::new()),
        tracker: TaskTracker::new(),
    });

    Harness {
        app: crate::routes::router(state.clone()),
        state,
        secret,
        project_id: project.id,
    }
}

fn post(uri: &str, secret: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn chat_body(content: &str) -> Value {
    json!({
        "model": "m-1",
        "messages": [{"role": "user", "content": content}],
    })
}

fn ok_completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-e2e",
        "object": "chat.completion",
        "created": 1,
        "model": "m-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12},
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The cache insert runs detached after the leader completes; wait for the
/// entry to land by recomputing the request's fingerprint and polling the
/// index directly, so the wait itself issues no requests.
async fn wait_for_cache_entry(harness: &Harness, body: &Value) {
    let payload: crate::api_types::CreateChatCompletionPayload =
        serde_json::from_value(body.clone()).unwrap();
    let norm = crate::cache::normalize_chat("/v1/chat/completions", &payload);
    let fp = crate::cache::fingerprint(&norm);
    for _ in 0..200 {
        if harness
            .state
            .cache
            .index()
            .exact_get(harness.project_id, &fp)
            .await
            .unwrap()
            .is_some()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache entry never landed");
}

#[tokio::test]
async fn scenario_exact_hit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion("Hi there.")))
        .expect(1)
        .mount(&server)
        .await;

    let harness = harness(&server, Plan::Pro, 0.85).await;

    let first = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("X-Cache").unwrap(), "MISS");
    assert!(first.headers().contains_key("X-RateLimit-Limit"));
    assert!(first.headers().contains_key("X-Quota-Remaining"));
    let first_body = body_json(first).await;
    assert_eq!(first_body["choices"][0]["message"]["content"], "Hi there.");

    wait_for_cache_entry(&harness, &chat_body("Hello")).await;
    let second = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(second.headers().get("X-Cache").unwrap(), "EXACT");
    let second_body = body_json(second).await;
    assert_eq!(second_body, first_body);
    // expect(1) on the mock proves the second request made no upstream call.
}

#[tokio::test]
async fn scenario_semantic_hit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion("Paris.")))
        .expect(1)
        .mount(&server)
        .await;

    // The hashing embedder needs a generous threshold to clear on paraphrases.
    let harness = harness(&server, Plan::Pro, 0.6).await;

    let seed = harness
        .app
        .clone()
        .oneshot(post(
            "/v1/chat/completions",
            &harness.secret,
            chat_body("What is the capital of France?"),
        ))
        .await
        .unwrap();
    assert_eq!(seed.headers().get("X-Cache").unwrap(), "MISS");

    // Wait for the detached insert to land before the paraphrase probe.
    wait_for_cache_entry(&harness, &chat_body("What is the capital of France?")).await;

    let similar = harness
        .app
        .clone()
        .oneshot(post(
            "/v1/chat/completions",
            &harness.secret,
            chat_body("Which city is the capital of France?"),
        ))
        .await
        .unwrap();
    assert_eq!(similar.headers().get("X-Cache").unwrap(), "SEMANTIC");
    let similarity: f64 = similar
        .headers()
        .get("X-Cache-Similarity")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(similarity > 0.6 && similarity < 1.0);
    let body = body_json(similar).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Paris.");
}

#[tokio::test]
async fn scenario_streaming_miss_then_cached_replay() {
    let sse_body = concat!(
        "data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m-1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Paris\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\".\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m-1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = harness(&server, Plan::Pro, 0.85).await;
    let mut stream_request = chat_body("Capital of France?");
    stream_request["stream"] = Value::Bool(true);

    let first = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, stream_request.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("X-Cache").unwrap(), "MISS");
    assert_eq!(
        first.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let first_text = body_text(first).await;
    assert!(first_text.contains("Paris"));
    assert!(first_text.contains("[DONE]"));

    // The second identical stream replays from cache with the same content
    // and finish reason.
    wait_for_cache_entry(&harness, &stream_request).await;
    let second = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, stream_request))
        .await
        .unwrap();
    assert_eq!(second.headers().get("X-Cache").unwrap(), "EXACT");
    assert_eq!(
        second.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let second_text = body_text(second).await;
    let frames: Vec<&str> = second_text
        .split("\n\n")
        .filter(|l| l.starts_with("data: ") && !l.contains("[DONE]"))
        .collect();
    let mut content = String::new();
    let mut finish = None;
    for frame in frames {
        let chunk: Value = serde_json::from_str(frame.trim_start_matches("data: ")).unwrap();
        if let Some(piece) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(piece);
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(reason.to_string());
        }
    }
    assert_eq!(content, "Paris.");
    assert_eq!(finish.as_deref(), Some("stop"));
    assert!(second_text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn scenario_rate_limit_on_the_free_plan() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion("Hi.")))
        .expect(1)
        .mount(&server)
        .await;

    let harness = harness(&server, Plan::Free, 0.85).await;

    // First request goes upstream; wait for its insert so the remaining
    // nine are deterministic cache hits.
    let first = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    wait_for_cache_entry(&harness, &chat_body("Hello")).await;

    for i in 0..9 {
        let response = harness
            .app
            .clone()
            .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {} failed", i + 2);
    }

    let eleventh = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(eleventh.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = eleventh
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body = body_json(eleventh).await;
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    let details_retry = body["error"]["details"]["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&details_retry));
    // expect(1): the 11th request (and the 9 cache hits) made no upstream call.
}

#[tokio::test]
async fn scenario_provider_failover() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream-primary"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream-backup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion("Hi.")))
        .mount(&server)
        .await;

    let harness = harness(&server, Plan::Pro, 0.85).await;
    // Add the priority-2 key the failover lands on.
    let sealed = harness.state.vault.encrypt("sk-upstream-backup").unwrap();
    harness
        .state
        .store
        .save_provider_key(NewProviderKey {
            project_id: harness.project_id,
            provider: ProviderKind::OpenAi,
            encrypted_key: sealed.encrypted_key,
            iv: sealed.iv,
            name: "backup".to_string(),
        })
        .await
        .unwrap();

    let response = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Hi.");

    // The winning (priority 2) provider key is recorded via last_used_at.
    let keys = harness
        .state
        .store
        .active_provider_keys(harness.project_id, ProviderKind::OpenAi)
        .await
        .unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys[0].last_used_at.is_none());
    assert!(keys[1].last_used_at.is_some());

    // The usage log rows carry the client's gateway key and the provider.
    for _ in 0..50 {
        let logs = harness
            .state
            .store
            .usage_logs(harness.project_id, &crate::store::UsageLogFilter::default())
            .await
            .unwrap();
        if !logs.is_empty() {
            assert_eq!(logs[0].provider, "openai");
            assert_eq!(logs[0].status, crate::models::RequestStatus::Success);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("usage log never appeared");
}

#[tokio::test]
async fn scenario_invalidation_turns_hits_into_misses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion("Hi.")))
        .expect(2)
        .mount(&server)
        .await;

    let harness = harness(&server, Plan::Pro, 0.85).await;

    harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    wait_for_cache_entry(&harness, &chat_body("Hello")).await;

    let hit = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(hit.headers().get("X-Cache").unwrap(), "EXACT");

    let invalidate = harness
        .app
        .clone()
        .oneshot(post(
            "/v1/cache/invalidate",
            &harness.secret,
            json!({"model": "m-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(invalidate.status(), StatusCode::OK);
    let body = body_json(invalidate).await;
    assert!(body["entries_invalidated"].as_u64().unwrap() >= 1);

    let after = harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();
    assert_eq!(after.headers().get("X-Cache").unwrap(), "MISS");
}

#[tokio::test]
async fn missing_bearer_token_is_rejected_with_the_envelope() {
    let server = MockServer::start().await;
    let harness = harness(&server, Plan::Free, 0.85).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(chat_body("Hello").to_string()))
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "unauthorized");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn admin_surface_round_trip() {
    let server = MockServer::start().await;
    let harness = harness(&server, Plan::Pro, 0.85).await;

    // TTL update with a valid override.
    let update = harness
        .app
        .clone()
        .oneshot(post(
            "/v1/cache/ttl",
            &harness.secret,
            json!({
                "default_ttl": 7200,
                "overrides": {"/v1/embeddings": 600},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(update.status(), StatusCode::OK);

    // Out-of-range TTL is rejected.
    let bad = harness
        .app
        .clone()
        .oneshot(post("/v1/cache/ttl", &harness.secret, json!({"default_ttl": 30})))
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    // Threshold outside [0.5, 0.99] is rejected.
    let bad = harness
        .app
        .clone()
        .oneshot(post(
            "/v1/cache/threshold",
            &harness.secret,
            json!({"threshold": 0.3}),
        ))
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    // Provider key CRUD: a fourth active key for one provider is refused.
    for i in 0..2 {
        let created = harness
            .app
            .clone()
            .oneshot(post(
                "/v1/keys/provider",
                &harness.secret,
                json!({"provider": "openai", "key": format!("sk-extra-{i}"), "name": format!("extra-{i}")}),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
    }
    let overflow = harness
        .app
        .clone()
        .oneshot(post(
            "/v1/keys/provider",
            &harness.secret,
            json!({"provider": "openai", "key": "sk-overflow", "name": "overflow"}),
        ))
        .await
        .unwrap();
    assert_eq!(overflow.status(), StatusCode::BAD_REQUEST);

    // Listing masks key material.
    let listing = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/keys/provider")
                .header("authorization", format!("Bearer {}", harness.secret))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let keys = body_json(listing).await;
    let listed = keys.as_array().unwrap();
    assert_eq!(listed.len(), 3);
    for key in listed {
        let preview = key["key_preview"].as_str().unwrap();
        assert!(preview.starts_with('…'));
        assert!(!key.to_string().contains("sk-extra"));
    }
}

#[tokio::test]
async fn cron_endpoint_requires_the_shared_secret() {
    let server = MockServer::start().await;
    let harness = harness(&server, Plan::Free, 0.85).await;

    let unauthorized = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/cron/cost-alerts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    let authorized = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/cron/cost-alerts")
                .header("X-Cron-Secret", "test-cron-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(authorized.status(), StatusCode::OK);
}

#[tokio::test]
async fn telemetry_events_flow_from_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion("Hi.")))
        .mount(&server)
        .await;

    let harness = harness(&server, Plan::Pro, 0.85).await;
    harness
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", &harness.secret, chat_body("Hello")))
        .await
        .unwrap();

    // The lifecycle enqueued a prompt_call event for the request.
    for _ in 0..50 {
        if !harness.state.telemetry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no telemetry event was enqueued");
}
