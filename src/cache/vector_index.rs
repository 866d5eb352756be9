//! Vector index for cached responses.
//!
//! Stores cache entries keyed by (project, fingerprint) and answers exact
//! lookups, cosine nearest-neighbor queries, and invalidation filters.
//! Expiry is lazy: expired entries are skipped on read and physically
//! removed on the next write or a scheduled sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A cached response plus the metadata the engine and admin surface need.
///
/// Uniqueness: (project_id, fingerprint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub project_id: Uuid,
    pub endpoint_path: String,
    pub provider: String,
    pub model: String,
    /// Unit-normalized prompt embedding; absent when the embedder was
    /// unavailable at insert time (entry is then exact-match only).
    pub prompt_embedding: Option<Vec<f32>>,
    pub canonical_response: serde_json::Value,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_microcents: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// `None` means the entry never expires (infinite TTL).
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}

/// A nearest-neighbor match with its cosine similarity.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: CacheEntry,
    pub score: f64,
}

/// Invalidation filter. `all: true` dominates every other field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvalidationFilter {
    pub model: Option<String>,
    pub endpoint_path: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub all: bool,
}

impl InvalidationFilter {
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if self.all {
            return true;
        }
        if let Some(model) = &self.model
            && entry.model != *model
        {
            return false;
        }
        if let Some(endpoint) = &self.endpoint_path
            && entry.endpoint_path != *endpoint
        {
            return false;
        }
        if let Some(before) = self.before
            && entry.created_at >= before
        {
            return false;
        }
        if let Some(after) = self.after
            && entry.created_at <= after
        {
            return false;
        }
        // An empty filter matches nothing; callers wanting everything pass
        // `all: true` explicitly.
        self.model.is_some()
            || self.endpoint_path.is_some()
            || self.before.is_some()
            || self.after.is_some()
    }
}

#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("vector index backend error: {0}")]
    Backend(String),

    #[error("vector index call timed out")]
    Timeout,
}

/// Cosine similarity. Inputs are expected unit-normalized, but the norm is
/// recomputed so non-normalized vectors still compare correctly.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace an entry. Idempotent on (project_id, fingerprint);
    /// a replace keeps the accumulated hit count.
    async fn put(&self, entry: CacheEntry) -> Result<(), VectorIndexError>;

    /// O(1) lookup by fingerprint. Expired entries read as absent.
    async fn exact_get(
        &self,
        project_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<CacheEntry>, VectorIndexError>;

    /// Top-k entries with cosine similarity ≥ `min_score`, restricted to the
    /// endpoint and to non-expired entries. Ties break by larger hit count,
    /// then newer creation time.
    async fn nearest(
        &self,
        project_id: Uuid,
        endpoint_path: &str,
        vector: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredEntry>, VectorIndexError>;

    /// Increment an entry's hit count.
    async fn record_hit(&self, project_id: Uuid, fingerprint: &str)
    -> Result<(), VectorIndexError>;

    /// Remove entries matching the filter; returns how many were removed.
    async fn invalidate(
        &self,
        project_id: Uuid,
        filter: &InvalidationFilter,
    ) -> Result<u64, VectorIndexError>;

    /// Physically remove expired entries; returns how many were evicted.
    async fn sweep(&self) -> Result<u64, VectorIndexError>;

    /// Snapshot of a project's entries (including expired ones) for the
    /// admin stats surface.
    async fn project_snapshot(&self, project_id: Uuid)
    -> Result<Vec<CacheEntry>, VectorIndexError>;
}

/// In-memory index backed by a concurrent map.
///
/// Single-node only: a multi-node deployment wants a shared backend behind
/// the same trait.
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: DashMap<(Uuid, String), CacheEntry>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_expired_for_project(&self, project_id: Uuid, now: DateTime<Utc>) {
        self.entries
            .retain(|(pid, _), entry| *pid != project_id || !entry.is_expired(now));
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn put(&self, entry: CacheEntry) -> Result<(), VectorIndexError> {
        let now = Utc::now();
        // Writes pay for the lazy eviction of their project's expired rows.
        self.evict_expired_for_project(entry.project_id, now);

        let key = (entry.project_id, entry.fingerprint.clone());
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let hit_count = existing.get().hit_count;
                let mut entry = entry;
                entry.hit_count = hit_count;
                existing.insert(entry);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        Ok(())
    }

    async fn exact_get(
        &self,
        project_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<CacheEntry>, VectorIndexError> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(&(project_id, fingerprint.to_string()))
            .filter(|e| !e.is_expired(now))
            .map(|e| e.clone()))
    }

    async fn nearest(
        &self,
        project_id: Uuid,
        endpoint_path: &str,
        vector: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredEntry>, VectorIndexError> {
        let now = Utc::now();
        let mut scored: Vec<ScoredEntry> = self
            .entries
            .iter()
            .filter(|e| {
                e.project_id == project_id
                    && e.endpoint_path == endpoint_path
                    && !e.is_expired(now)
            })
            .filter_map(|e| {
                let embedding = e.prompt_embedding.as_ref()?;
                let score = cosine_similarity(embedding, vector);
                (score >= min_score).then(|| ScoredEntry {
                    entry: e.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.hit_count.cmp(&a.entry.hit_count))
                .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn record_hit(
        &self,
        project_id: Uuid,
        fingerprint: &str,
    ) -> Result<(), VectorIndexError> {
        if let Some(mut entry) = self.entries.get_mut(&(project_id, fingerprint.to_string())) {
            entry.hit_count += 1;
        }
        Ok(())
    }

    async fn invalidate(
        &self,
        project_id: Uuid,
        filter: &InvalidationFilter,
    ) -> Result<u64, VectorIndexError> {
        let before = self.entries.len();
        self.entries
            .retain(|(pid, _), entry| *pid != project_id || !filter.matches(entry));
        Ok((before - self.entries.len()) as u64)
    }

    async fn sweep(&self) -> Result<u64, VectorIndexError> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = (before - self.entries.len()) as u64;
        if evicted > 0 {
            tracing::debug!(evicted, "cache sweep removed expired entries");
        }
        Ok(evicted)
    }

    async fn project_snapshot(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<CacheEntry>, VectorIndexError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.project_id == project_id)
            .map(|e| e.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn entry(
        project_id: Uuid,
        fingerprint: &str,
        embedding: Option<Vec<f32>>,
    ) -> CacheEntry {
        CacheEntry {
            fingerprint: fingerprint.to_string(),
            project_id,
            endpoint_path: "/v1/chat/completions".to_string(),
            provider: "openai".to_string(),
            model: "m-1".to_string(),
            prompt_embedding: embedding,
            canonical_response: serde_json::json!({"ok": true}),
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_microcents: Some(100),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            hit_count: 0,
        }
    }

    #[test]
    fn cosine_of_identical_unit_vectors_is_one() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn exact_get_skips_expired_entries() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();
        let mut e = entry(project, "fp-1", None);
        e.expires_at = Some(Utc::now() - Duration::seconds(1));
        index.put(e).await.unwrap();
        assert!(index.exact_get(project, "fp-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn infinite_ttl_entries_never_expire() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();
        let mut e = entry(project, "fp-1", None);
        e.expires_at = None;
        e.created_at = Utc::now() - Duration::days(4000);
        index.put(e).await.unwrap();
        assert!(index.exact_get(project, "fp-1").await.unwrap().is_some());
        assert_eq!(index.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn put_preserves_hit_count_on_replace() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();
        index.put(entry(project, "fp-1", None)).await.unwrap();
        index.record_hit(project, "fp-1").await.unwrap();
        index.record_hit(project, "fp-1").await.unwrap();
        index.put(entry(project, "fp-1", None)).await.unwrap();
        let stored = index.exact_get(project, "fp-1").await.unwrap().unwrap();
        assert_eq!(stored.hit_count, 2);
    }

    #[tokio::test]
    async fn nearest_filters_by_endpoint_threshold_and_expiry() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();

        index
            .put(entry(project, "close", Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        index
            .put(entry(project, "far", Some(vec![0.0, 1.0])))
            .await
            .unwrap();
        let mut other_endpoint = entry(project, "other", Some(vec![1.0, 0.0]));
        other_endpoint.endpoint_path = "/v1/completions".to_string();
        index.put(other_endpoint).await.unwrap();
        let mut expired = entry(project, "expired", Some(vec![1.0, 0.0]));
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        index.put(expired).await.unwrap();

        let results = index
            .nearest(project, "/v1/chat/completions", &[1.0, 0.0], 5, 0.8)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.fingerprint, "close");
        assert!((results[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn nearest_breaks_ties_by_hit_count_then_recency() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();

        let mut older = entry(project, "older", Some(vec![1.0, 0.0]));
        older.created_at = Utc::now() - Duration::hours(2);
        let mut newer = entry(project, "newer", Some(vec![1.0, 0.0]));
        newer.created_at = Utc::now() - Duration::hours(1);
        index.put(older).await.unwrap();
        index.put(newer).await.unwrap();

        // Equal scores, equal hit counts: newer wins.
        let results = index
            .nearest(project, "/v1/chat/completions", &[1.0, 0.0], 2, 0.5)
            .await
            .unwrap();
        assert_eq!(results[0].entry.fingerprint, "newer");

        // Bump the older entry's hit count: it now wins.
        index.record_hit(project, "older").await.unwrap();
        let results = index
            .nearest(project, "/v1/chat/completions", &[1.0, 0.0], 2, 0.5)
            .await
            .unwrap();
        assert_eq!(results[0].entry.fingerprint, "older");
    }

    #[tokio::test]
    async fn invalidate_by_model_and_all() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();
        index.put(entry(project, "a", None)).await.unwrap();
        let mut other_model = entry(project, "b", None);
        other_model.model = "m-2".to_string();
        index.put(other_model).await.unwrap();

        let removed = index
            .invalidate(
                project,
                &InvalidationFilter {
                    model: Some("m-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(index.exact_get(project, "a").await.unwrap().is_none());
        assert!(index.exact_get(project, "b").await.unwrap().is_some());

        // `all: true` dominates other fields.
        let removed = index
            .invalidate(
                project,
                &InvalidationFilter {
                    model: Some("no-such-model".to_string()),
                    all: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn empty_filter_matches_nothing() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();
        index.put(entry(project, "a", None)).await.unwrap();
        let removed = index
            .invalidate(project, &InvalidationFilter::default())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn invalidation_is_project_scoped() {
        let index = MemoryVectorIndex::new();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        index.put(entry(p1, "a", None)).await.unwrap();
        index.put(entry(p2, "a", None)).await.unwrap();

        index
            .invalidate(
                p1,
                &InvalidationFilter {
                    all: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(index.exact_get(p1, "a").await.unwrap().is_none());
        assert!(index.exact_get(p2, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn write_evicts_expired_rows_for_the_project() {
        let index = MemoryVectorIndex::new();
        let project = Uuid::new_v4();
        let mut expired = entry(project, "old", None);
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        index.put(expired).await.unwrap();

        index.put(entry(project, "fresh", None)).await.unwrap();
        let snapshot = index.project_snapshot(project).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].fingerprint, "fresh");
    }
}
