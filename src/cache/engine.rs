//! The cache engine: exact + semantic lookup, TTL resolution, insert rules,
//! and single-flight coalescing.
//!
//! # Lookup ladder
//!
//! 1. Exact fingerprint match (fastest, similarity 1.0)
//! 2. Embed the normalized prompt; on embedder failure fall back to
//!    exact-only (step 1 already ran, so this is a miss, never an error)
//! 3. Cosine nearest-neighbor above the project threshold
//! 4. Miss: the caller joins the single-flight map

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use uuid::Uuid;

use super::{
    embedding::Embedder,
    fingerprint::{self, NormalizedRequest},
    flight::{FlightJoin, FlightMap},
    vector_index::{CacheEntry, InvalidationFilter, VectorIndex, VectorIndexError},
};
use crate::{
    api_types::{ChatCompletion, Usage},
    models::Project,
};

/// Candidates fetched per semantic search.
const NEAREST_K: usize = 5;

/// Deadline for one vector-index call.
pub const VECTOR_INDEX_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// Fingerprint matched exactly; similarity is 1.0 by definition.
    Exact(CacheEntry),
    /// A semantically similar entry cleared the project threshold.
    Semantic { entry: CacheEntry, similarity: f64 },
    /// Nothing usable; the caller proceeds to the single-flight join.
    Miss,
    /// Caching is disabled; the request goes straight upstream.
    Bypass,
}

/// What the engine needs to insert a finished response.
#[derive(Debug)]
pub struct InsertOutcome {
    pub canonical_response: serde_json::Value,
    pub provider: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub cost_microcents: Option<i64>,
}

pub struct CacheEngine {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    flights: FlightMap,
    enabled: bool,
}

impl CacheEngine {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>, enabled: bool) -> Self {
        Self {
            index,
            embedder,
            flights: FlightMap::default(),
            enabled,
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn flights(&self) -> &FlightMap {
        &self.flights
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run the lookup ladder. Records a hit on the returned entry.
    pub async fn lookup(
        &self,
        project: &Project,
        normalized: &NormalizedRequest,
        semantic: bool,
    ) -> (String, CacheLookup) {
        let fp = fingerprint::fingerprint(normalized);

        if !self.enabled {
            return (fp, CacheLookup::Bypass);
        }

        // Step 1: exact match.
        match tokio::time::timeout(
            VECTOR_INDEX_TIMEOUT,
            self.index.exact_get(project.id, &fp),
        )
        .await
        {
            Ok(Ok(Some(entry))) => {
                let _ = self.index.record_hit(project.id, &fp).await;
                tracing::debug!(fingerprint = %fp, "cache exact hit");
                return (fp, CacheLookup::Exact(entry));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                // Index failures on lookup degrade to a miss.
                tracing::warn!(error = %e, "vector index exact lookup failed; treating as miss");
                return (fp, CacheLookup::Miss);
            }
            Err(_) => {
                tracing::warn!("vector index exact lookup timed out; treating as miss");
                return (fp, CacheLookup::Miss);
            }
        }

        if !semantic {
            return (fp, CacheLookup::Miss);
        }

        // Step 2: embed. Failure degrades to exact-only, which already missed.
        let vector = match self.embedder.embed(&normalized.prompt_text()).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "embedder failed; exact-only lookup");
                return (fp, CacheLookup::Miss);
            }
        };

        // Step 3: nearest neighbors above the project threshold.
        let candidates = match tokio::time::timeout(
            VECTOR_INDEX_TIMEOUT,
            self.index.nearest(
                project.id,
                &normalized.endpoint,
                &vector,
                NEAREST_K,
                project.semantic_cache_threshold,
            ),
        )
        .await
        {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "vector search failed; treating as miss");
                return (fp, CacheLookup::Miss);
            }
            Err(_) => {
                tracing::warn!("vector search timed out; treating as miss");
                return (fp, CacheLookup::Miss);
            }
        };

        if let Some(best) = candidates.into_iter().next() {
            let _ = self
                .index
                .record_hit(project.id, &best.entry.fingerprint)
                .await;
            tracing::debug!(
                fingerprint = %fp,
                matched = %best.entry.fingerprint,
                similarity = best.score,
                "cache semantic hit"
            );
            return (
                fp,
                CacheLookup::Semantic {
                    entry: best.entry,
                    similarity: best.score,
                },
            );
        }

        (fp, CacheLookup::Miss)
    }

    /// Join the single-flight window for a missed fingerprint.
    pub fn join_flight(&self, project_id: Uuid, fingerprint: &str) -> FlightJoin {
        self.flights.join(project_id, fingerprint)
    }

    /// Insert a completed response. Chat responses must carry a terminal
    /// finish reason and non-empty content; anything else is refused.
    ///
    /// The prompt embedding is generated here, off the client's path; when
    /// the embedder is down the entry is stored exact-only.
    pub async fn insert(
        &self,
        project: &Project,
        normalized: &NormalizedRequest,
        fingerprint: String,
        outcome: InsertOutcome,
    ) -> Result<(), VectorIndexError> {
        if !self.enabled {
            return Ok(());
        }

        if normalized.endpoint == "/v1/chat/completions" {
            let cacheable = serde_json::from_value::<ChatCompletion>(
                outcome.canonical_response.clone(),
            )
            .map(|c| c.is_cacheable())
            .unwrap_or(false);
            if !cacheable {
                tracing::debug!(
                    fingerprint = %fingerprint,
                    "skipping cache insert: response is not terminal or has empty content"
                );
                return Ok(());
            }
        }

        let embedding = match self.embedder.embed(&normalized.prompt_text()).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed at insert; entry is exact-only");
                None
            }
        };

        let now = Utc::now();
        let ttl = project.effective_ttl(&normalized.endpoint);
        let usage = outcome.usage.unwrap_or_default();
        let entry = CacheEntry {
            fingerprint,
            project_id: project.id,
            endpoint_path: normalized.endpoint.clone(),
            provider: outcome.provider,
            model: outcome.model,
            prompt_embedding: embedding,
            canonical_response: outcome.canonical_response,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_microcents: outcome.cost_microcents,
            created_at: now,
            expires_at: ttl.expires_at(now),
            hit_count: 0,
        };

        tokio::time::timeout(VECTOR_INDEX_TIMEOUT, self.index.put(entry))
            .await
            .map_err(|_| VectorIndexError::Timeout)?
    }

    /// Remove entries matching the filter; `all: true` dominates.
    pub async fn invalidate(
        &self,
        project_id: Uuid,
        filter: &InvalidationFilter,
    ) -> Result<u64, VectorIndexError> {
        self.index.invalidate(project_id, filter).await
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("enabled", &self.enabled)
            .field("in_flight", &self.flights.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        api_types::CreateChatCompletionPayload,
        cache::{
            embedding::{EmbedderError, HashEmbedder},
            fingerprint::normalize_chat,
            vector_index::MemoryVectorIndex,
        },
        models::CacheTtl,
    };

    fn project(threshold: f64) -> Project {
        Project {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            semantic_cache_threshold: threshold,
            cache_ttl: CacheTtl::Seconds(3600),
            cache_ttl_overrides: HashMap::new(),
            cost_alert_threshold: None,
            cost_alerts_enabled: false,
        }
    }

    fn engine(threshold_embedder: Arc<dyn Embedder>) -> CacheEngine {
        CacheEngine::new(Arc::new(MemoryVectorIndex::new()), threshold_embedder, true)
    }

    fn chat(content: &str) -> CreateChatCompletionPayload {
        serde_json::from_value(serde_json::json!({
            "model": "m-1",
            "messages": [{"role": "user", "content": content}],
        }))
        .unwrap()
    }

    fn completion_json(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "m-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9},
        })
    }

    fn outcome(content: &str) -> InsertOutcome {
        InsertOutcome {
            canonical_response: completion_json(content),
            provider: "openai".to_string(),
            model: "m-1".to_string(),
            usage: Some(Usage {
                prompt_tokens: 7,
                completion_tokens: 2,
                total_tokens: 9,
            }),
            cost_microcents: Some(25),
        }
    }

    #[tokio::test]
    async fn miss_then_exact_hit() {
        let engine = engine(Arc::new(HashEmbedder::new(128)));
        let project = project(0.85);
        let norm = normalize_chat("/v1/chat/completions", &chat("Hello"));

        let (fp, lookup) = engine.lookup(&project, &norm, true).await;
        assert!(matches!(lookup, CacheLookup::Miss));

        engine
            .insert(&project, &norm, fp.clone(), outcome("Hi there."))
            .await
            .unwrap();

        let (fp2, lookup) = engine.lookup(&project, &norm, true).await;
        assert_eq!(fp, fp2);
        match lookup {
            CacheLookup::Exact(entry) => {
                assert_eq!(entry.canonical_response["choices"][0]["message"]["content"], "Hi there.");
                assert_eq!(entry.hit_count, 0); // hit recorded after the read
            }
            other => panic!("expected exact hit, got {other:?}"),
        }

        // The hit was recorded on the stored entry.
        let stored = engine.index.exact_get(project.id, &fp).await.unwrap().unwrap();
        assert_eq!(stored.hit_count, 1);
    }

    #[tokio::test]
    async fn semantic_hit_above_threshold() {
        let engine = engine(Arc::new(HashEmbedder::new(256)));
        let project = project(0.6);

        let seeded = normalize_chat(
            "/v1/chat/completions",
            &chat("What is the capital of France?"),
        );
        let (fp, _) = engine.lookup(&project, &seeded, true).await;
        engine
            .insert(&project, &seeded, fp, outcome("Paris."))
            .await
            .unwrap();

        let similar = normalize_chat(
            "/v1/chat/completions",
            &chat("Which city is the capital of France?"),
        );
        let (_, lookup) = engine.lookup(&project, &similar, true).await;
        match lookup {
            CacheLookup::Semantic { entry, similarity } => {
                assert!(similarity > 0.6 && similarity < 1.0);
                assert_eq!(
                    entry.canonical_response["choices"][0]["message"]["content"],
                    "Paris."
                );
            }
            other => panic!("expected semantic hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_prompt_misses_below_threshold() {
        let engine = engine(Arc::new(HashEmbedder::new(256)));
        let project = project(0.6);

        let seeded = normalize_chat(
            "/v1/chat/completions",
            &chat("What is the capital of France?"),
        );
        let (fp, _) = engine.lookup(&project, &seeded, true).await;
        engine
            .insert(&project, &seeded, fp, outcome("Paris."))
            .await
            .unwrap();

        let unrelated = normalize_chat(
            "/v1/chat/completions",
            &chat("Write a limerick about compilers"),
        );
        let (_, lookup) = engine.lookup(&project, &unrelated, true).await;
        assert!(matches!(lookup, CacheLookup::Miss));
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
            Err(EmbedderError::Timeout)
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn embedder_failure_degrades_to_exact_only() {
        let engine = engine(Arc::new(FailingEmbedder));
        let project = project(0.85);
        let norm = normalize_chat("/v1/chat/completions", &chat("Hello"));

        let (fp, lookup) = engine.lookup(&project, &norm, true).await;
        assert!(matches!(lookup, CacheLookup::Miss));

        // Insert succeeds without an embedding; exact lookups still hit.
        engine
            .insert(&project, &norm, fp.clone(), outcome("Hi."))
            .await
            .unwrap();
        let (_, lookup) = engine.lookup(&project, &norm, true).await;
        assert!(matches!(lookup, CacheLookup::Exact(_)));

        let stored = engine.index.exact_get(project.id, &fp).await.unwrap().unwrap();
        assert!(stored.prompt_embedding.is_none());
    }

    #[tokio::test]
    async fn non_terminal_responses_are_not_cached() {
        let engine = engine(Arc::new(HashEmbedder::new(64)));
        let project = project(0.85);
        let norm = normalize_chat("/v1/chat/completions", &chat("Hello"));
        let (fp, _) = engine.lookup(&project, &norm, true).await;

        let mut partial = outcome("partial answer");
        partial.canonical_response["choices"][0]["finish_reason"] = serde_json::Value::Null;
        engine
            .insert(&project, &norm, fp.clone(), partial)
            .await
            .unwrap();
        assert!(engine.index.exact_get(project.id, &fp).await.unwrap().is_none());

        let mut empty = outcome("");
        empty.canonical_response["choices"][0]["message"]["content"] =
            serde_json::Value::String(String::new());
        engine.insert(&project, &norm, fp.clone(), empty).await.unwrap();
        assert!(engine.index.exact_get(project.id, &fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_engine_bypasses() {
        let engine = CacheEngine::new(
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(HashEmbedder::new(64)),
            false,
        );
        let project = project(0.85);
        let norm = normalize_chat("/v1/chat/completions", &chat("Hello"));
        let (_, lookup) = engine.lookup(&project, &norm, true).await;
        assert!(matches!(lookup, CacheLookup::Bypass));
    }

    #[tokio::test]
    async fn ttl_override_applies_to_insert() {
        let engine = engine(Arc::new(HashEmbedder::new(64)));
        let mut project = project(0.85);
        project.cache_ttl = CacheTtl::Infinite;
        project
            .cache_ttl_overrides
            .insert("/v1/chat/completions".to_string(), CacheTtl::Seconds(60));

        let norm = normalize_chat("/v1/chat/completions", &chat("Hello"));
        let (fp, _) = engine.lookup(&project, &norm, true).await;
        engine
            .insert(&project, &norm, fp.clone(), outcome("Hi."))
            .await
            .unwrap();

        let stored = engine.index.exact_get(project.id, &fp).await.unwrap().unwrap();
        let expires = stored.expires_at.expect("override is finite");
        let delta = expires - stored.created_at;
        assert_eq!(delta.num_seconds(), 60);
    }

    #[tokio::test]
    async fn invalidation_turns_hits_back_into_misses() {
        let engine = engine(Arc::new(HashEmbedder::new(64)));
        let project = project(0.85);
        let norm = normalize_chat("/v1/chat/completions", &chat("Hello"));
        let (fp, _) = engine.lookup(&project, &norm, true).await;
        engine
            .insert(&project, &norm, fp.clone(), outcome("Hi."))
            .await
            .unwrap();

        let removed = engine
            .invalidate(
                project.id,
                &InvalidationFilter {
                    model: Some("m-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let (_, lookup) = engine.lookup(&project, &norm, true).await;
        assert!(matches!(lookup, CacheLookup::Miss));
    }
}
