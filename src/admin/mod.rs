//! Admin operations: provider-key CRUD, cache TTL updates, invalidation,
//! cache statistics, tuning recommendations, and the scheduled cost-alert
//! sweep.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    cache::{CacheEngine, InvalidationFilter, VectorIndex},
    error::GatewayError,
    limits::{QuotaTracker, year_month},
    models::{
        CacheFeedback, CacheTtl, MAX_SEMANTIC_THRESHOLD, MIN_SEMANTIC_THRESHOLD, ProviderKey,
        ProviderKind,
    },
    providers::EndpointKind,
    store::{GatewayStore, NewProviderKey},
    telemetry::{EnvKind, EventKind, TelemetryEvent, TelemetryQueue},
    vault::Vault,
};

/// Fixed cost-alert thresholds, always checked alongside the project's
/// custom one.
const ALERT_THRESHOLDS: [u8; 5] = [50, 75, 90, 95, 100];
/// An alert fires only while usage sits within this many percentage points
/// above a threshold.
const ALERT_BAND_PP: u8 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Provider keys
// ─────────────────────────────────────────────────────────────────────────────

/// Listing view of a provider key: metadata plus a masked preview, never
/// the secret.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderKeySummary {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub name: String,
    pub priority: u8,
    pub is_active: bool,
    pub key_preview: String,
    pub last_used_at: Option<DateTime<Utc>>,
}

fn mask_key(plaintext: &str) -> String {
    let tail: String = plaintext
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{tail}")
}

/// Encrypt and persist a provider key. The ≤3-active and dense-priority
/// invariants are enforced by the store.
pub async fn save_provider_key(
    store: &Arc<dyn GatewayStore>,
    vault: &Vault,
    project_id: Uuid,
    provider: ProviderKind,
    plaintext: &str,
    name: &str,
) -> Result<ProviderKey, GatewayError> {
    if plaintext.trim().is_empty() {
        return Err(GatewayError::BadRequest("provider key is empty".to_string()));
    }
    let sealed = vault
        .encrypt(plaintext)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    store
        .save_provider_key(NewProviderKey {
            project_id,
            provider,
            encrypted_key: sealed.encrypted_key,
            iv: sealed.iv,
            name: name.to_string(),
        })
        .await
        .map_err(|e| match e {
            crate::store::StoreError::Conflict(msg) => GatewayError::BadRequest(msg),
            other => GatewayError::Internal(other.to_string()),
        })
}

pub async fn list_provider_keys(
    store: &Arc<dyn GatewayStore>,
    vault: &Vault,
    project_id: Uuid,
) -> Result<Vec<ProviderKeySummary>, GatewayError> {
    let keys = store
        .list_provider_keys(project_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(keys
        .into_iter()
        .map(|key| {
            let preview = vault
                .decrypt(&crate::vault::SealedKey {
                    encrypted_key: key.encrypted_key.clone(),
                    iv: key.iv.clone(),
                })
                .map(|plaintext| mask_key(&plaintext))
                .unwrap_or_else(|_| "…????".to_string());
            ProviderKeySummary {
                id: key.id,
                provider: key.provider,
                name: key.name,
                priority: key.priority,
                is_active: key.is_active,
                key_preview: preview,
                last_used_at: key.last_used_at,
            }
        })
        .collect())
}

pub async fn delete_provider_key(
    store: &Arc<dyn GatewayStore>,
    project_id: Uuid,
    key_id: Uuid,
) -> Result<bool, GatewayError> {
    store
        .delete_provider_key(project_id, key_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache TTL
// ─────────────────────────────────────────────────────────────────────────────

/// Update a project's TTL settings. Finite TTLs must sit in
/// [60s, 1 year]; override keys are validated (on write only) against the
/// proxied endpoint paths.
pub async fn update_cache_ttl(
    store: &Arc<dyn GatewayStore>,
    project_id: Uuid,
    default_ttl: CacheTtl,
    overrides: HashMap<String, CacheTtl>,
) -> Result<crate::models::Project, GatewayError> {
    if !default_ttl.is_valid() {
        return Err(GatewayError::BadRequest(
            "cache TTL must be between 60 seconds and 1 year, or infinite".to_string(),
        ));
    }
    for (endpoint, ttl) in &overrides {
        if EndpointKind::from_path(endpoint).is_none() {
            return Err(GatewayError::BadRequest(format!(
                "unknown endpoint path in TTL override: {endpoint}"
            )));
        }
        if !ttl.is_valid() {
            return Err(GatewayError::BadRequest(format!(
                "TTL override for {endpoint} is out of range"
            )));
        }
    }
    store
        .update_cache_ttl(project_id, default_ttl, overrides)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Update a project's semantic threshold, bounds-checked.
pub async fn update_semantic_threshold(
    store: &Arc<dyn GatewayStore>,
    project_id: Uuid,
    threshold: f64,
) -> Result<crate::models::Project, GatewayError> {
    if !(MIN_SEMANTIC_THRESHOLD..=MAX_SEMANTIC_THRESHOLD).contains(&threshold) {
        return Err(GatewayError::BadRequest(format!(
            "semantic threshold must be within [{MIN_SEMANTIC_THRESHOLD}, {MAX_SEMANTIC_THRESHOLD}]"
        )));
    }
    store
        .update_semantic_threshold(project_id, threshold)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Invalidation & stats
// ─────────────────────────────────────────────────────────────────────────────

pub async fn invalidate_cache(
    engine: &CacheEngine,
    project_id: Uuid,
    filter: &InvalidationFilter,
) -> Result<u64, GatewayError> {
    engine
        .invalidate(project_id, filter)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Entry-age distribution plus aggregate counters for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheAgeStats {
    pub entries: u64,
    pub expired: u64,
    pub total_hits: u64,
    pub avg_age_secs: f64,
    /// Buckets: <1h, 1-6h, 6-24h, 1-7d, 7-30d, >30d.
    pub age_buckets: [u64; 6],
}

fn age_bucket(age_secs: i64) -> usize {
    const HOUR: i64 = 3_600;
    const DAY: i64 = 86_400;
    match age_secs {
        s if s < HOUR => 0,
        s if s < 6 * HOUR => 1,
        s if s < DAY => 2,
        s if s < 7 * DAY => 3,
        s if s < 30 * DAY => 4,
        _ => 5,
    }
}

pub async fn cache_age_stats(
    index: &Arc<dyn VectorIndex>,
    project_id: Uuid,
) -> Result<CacheAgeStats, GatewayError> {
    let now = Utc::now();
    let entries = index
        .project_snapshot(project_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let mut stats = CacheAgeStats::default();
    let mut age_sum = 0i64;
    let mut live = 0u64;
    for entry in &entries {
        if entry.is_expired(now) {
            stats.expired += 1;
            continue;
        }
        live += 1;
        stats.total_hits += entry.hit_count;
        let age = (now - entry.created_at).num_seconds().max(0);
        age_sum += age;
        stats.age_buckets[age_bucket(age)] += 1;
    }
    stats.entries = live;
    stats.avg_age_secs = if live == 0 {
        0.0
    } else {
        age_sum as f64 / live as f64
    };
    Ok(stats)
}

// ─────────────────────────────────────────────────────────────────────────────
// Recommendations
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdRecommendation {
    pub current: f64,
    pub recommended: f64,
    pub sample_count: usize,
    pub inaccurate_rate: f64,
}

/// Recommend a semantic threshold from accumulated hit feedback.
///
/// With at least 10 samples: an inaccuracy rate above 10% nudges the
/// threshold up by 0.03 (capped at 0.98); below 2% with a threshold above
/// 0.88 nudges it down by 0.02 (floored at 0.85). Anything else keeps the
/// current value.
pub fn threshold_recommendation(
    current: f64,
    feedback: &[CacheFeedback],
) -> Option<ThresholdRecommendation> {
    if feedback.len() < 10 {
        return None;
    }
    let inaccurate = feedback.iter().filter(|f| !f.accurate).count();
    let rate = inaccurate as f64 / feedback.len() as f64;

    let recommended = if rate > 0.10 {
        (current + 0.03).min(0.98)
    } else if rate < 0.02 && current > 0.88 {
        (current - 0.02).max(0.85)
    } else {
        return None;
    };

    Some(ThresholdRecommendation {
        current,
        recommended,
        sample_count: feedback.len(),
        inaccurate_rate: rate,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TtlRecommendation {
    pub current: CacheTtl,
    pub recommended: CacheTtl,
    pub stale_hit_pct: f64,
}

/// Recommend a TTL from the stale-hit share: the fraction of recorded hits
/// that landed on entries older than a day. Old entries still earning hits
/// argue for a longer TTL; a cache whose hits all land on fresh entries
/// while old ones expire unused argues for a shorter one.
pub async fn ttl_recommendation(
    index: &Arc<dyn VectorIndex>,
    project_id: Uuid,
    current: CacheTtl,
) -> Result<Option<TtlRecommendation>, GatewayError> {
    let now = Utc::now();
    let entries = index
        .project_snapshot(project_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let total_hits: u64 = entries.iter().map(|e| e.hit_count).sum();
    if total_hits < 10 {
        return Ok(None);
    }
    let stale_hits: u64 = entries
        .iter()
        .filter(|e| (now - e.created_at).num_seconds() > 86_400)
        .map(|e| e.hit_count)
        .sum();
    let stale_hit_pct = stale_hits as f64 / total_hits as f64 * 100.0;

    let recommended = match current {
        CacheTtl::Infinite => return Ok(None),
        CacheTtl::Seconds(secs) if stale_hit_pct > 30.0 => {
            CacheTtl::Seconds((secs * 2).min(crate::models::MAX_TTL_SECS))
        }
        CacheTtl::Seconds(secs) if stale_hit_pct < 5.0 && secs > 3_600 => {
            CacheTtl::Seconds((secs / 2).max(crate::models::MIN_TTL_SECS))
        }
        _ => return Ok(None),
    };

    Ok(Some(TtlRecommendation {
        current,
        recommended,
        stale_hit_pct,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Cost alerts
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatch target for cost alerts. The production deployment hangs an
/// email sender here; the default implementation logs.
pub trait AlertDispatcher: Send + Sync {
    fn dispatch(&self, project_id: Uuid, threshold_pct: u8, used: u64, limit: u64);
}

/// Log-only dispatcher.
pub struct LogAlertDispatcher;

impl AlertDispatcher for LogAlertDispatcher {
    fn dispatch(&self, project_id: Uuid, threshold_pct: u8, used: u64, limit: u64) {
        tracing::warn!(
            %project_id,
            threshold_pct,
            used,
            limit,
            "project crossed a cost alert threshold"
        );
    }
}

/// Scheduled sweep: for every project with alerts enabled, compare
/// month-to-date usage to the plan limit and dispatch each newly crossed
/// threshold exactly once per (project, month, threshold).
pub async fn cost_alerts_sweep(
    store: &Arc<dyn GatewayStore>,
    quota: &QuotaTracker,
    telemetry: &TelemetryQueue,
    dispatcher: &dyn AlertDispatcher,
    env: EnvKind,
    now: DateTime<Utc>,
) -> Result<u32, GatewayError> {
    let projects = store
        .projects()
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    let ym = year_month(now);
    let mut dispatched = 0u32;

    for project in projects.into_iter().filter(|p| p.cost_alerts_enabled) {
        let Some(tenant) = store
            .tenant(project.tenant_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
        else {
            continue;
        };
        let limit = tenant.plan.limits().requests_per_month;
        if limit == 0 {
            continue;
        }
        let used = quota.month_to_date(project.id, now);
        let pct = used as f64 / limit as f64 * 100.0;

        let mut thresholds: Vec<u8> = ALERT_THRESHOLDS.to_vec();
        if let Some(custom) = project.cost_alert_threshold
            && !thresholds.contains(&custom)
        {
            thresholds.push(custom);
        }

        for threshold in thresholds {
            let lower = threshold as f64;
            let upper = (threshold + ALERT_BAND_PP) as f64;
            if pct < lower || pct >= upper {
                continue;
            }
            let already = store
                .alert_sent(project.id, ym, threshold)
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            if already {
                continue;
            }

            dispatcher.dispatch(project.id, threshold, used, limit);
            telemetry.enqueue(TelemetryEvent {
                event_id: Uuid::new_v4(),
                project_id: project.id,
                run_id: format!("cost-alert-{ym}"),
                timestamp: now,
                env,
                tags: Vec::new(),
                client: None,
                kind: EventKind::CostThresholdExceeded {
                    threshold_pct: threshold,
                    month_to_date: used,
                    limit,
                },
            });
            store
                .record_alert(project.id, ym, threshold)
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            dispatched += 1;
        }
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::{
        cache::MemoryVectorIndex,
        models::{Plan, Project},
        store::MemoryStore,
    };

    fn feedback(accurate_count: usize, inaccurate_count: usize) -> Vec<CacheFeedback> {
        let mut all = Vec::new();
        for i in 0..accurate_count + inaccurate_count {
            all.push(CacheFeedback {
                id: Uuid::new_v4(),
                project_id: Uuid::new_v4(),
                cache_entry_fingerprint: "fp".to_string(),
                accurate: i < accurate_count,
                similarity_score: 0.9,
                created_at: Utc::now(),
            });
        }
        all
    }

    #[test]
    fn threshold_needs_ten_samples() {
        assert!(threshold_recommendation(0.85, &feedback(5, 4)).is_none());
        assert!(threshold_recommendation(0.85, &feedback(5, 5)).is_some());
    }

    #[rstest]
    // 20% inaccurate: raise by 0.03.
    #[case(0.85, 8, 2, Some(0.88))]
    // Raise is capped at 0.98.
    #[case(0.97, 8, 2, Some(0.98))]
    // 0% inaccurate with high threshold: lower by 0.02.
    #[case(0.92, 20, 0, Some(0.90))]
    // Lowering floors at 0.85.
    #[case(0.86, 20, 0, Some(0.85))]
    // 0% inaccurate but threshold not high: no change.
    #[case(0.85, 20, 0, None)]
    // 5% inaccurate: inside the comfort band, no change.
    #[case(0.90, 19, 1, None)]
    fn threshold_recommendation_cases(
        #[case] current: f64,
        #[case] accurate: usize,
        #[case] inaccurate: usize,
        #[case] expected: Option<f64>,
    ) {
        let got = threshold_recommendation(current, &feedback(accurate, inaccurate))
            .map(|r| r.recommended);
        match (got, expected) {
            (Some(g), Some(e)) => assert!((g - e).abs() < 1e-9, "got {g}, want {e}"),
            (None, None) => {}
            other => panic!("mismatch: {other:?}"),
        }
    }

    #[test]
    fn ttl_validation_bounds() {
        // Checked through update_cache_ttl's validation rules.
        assert!(!CacheTtl::Seconds(59).is_valid());
        assert!(CacheTtl::Seconds(60).is_valid());
    }

    #[tokio::test]
    async fn ttl_override_keys_are_validated_on_write() {
        let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
        let project_id = Uuid::new_v4();

        let mut bad = HashMap::new();
        bad.insert("/v1/images".to_string(), CacheTtl::Seconds(600));
        let err = update_cache_ttl(&store, project_id, CacheTtl::Seconds(3600), bad)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));

        let err = update_cache_ttl(&store, project_id, CacheTtl::Seconds(30), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn age_buckets_cover_the_documented_ranges() {
        assert_eq!(age_bucket(30 * 60), 0);
        assert_eq!(age_bucket(3 * 3_600), 1);
        assert_eq!(age_bucket(12 * 3_600), 2);
        assert_eq!(age_bucket(3 * 86_400), 3);
        assert_eq!(age_bucket(20 * 86_400), 4);
        assert_eq!(age_bucket(40 * 86_400), 5);
    }

    #[test]
    fn key_masking_keeps_only_the_tail() {
        assert_eq!(mask_key("sk-abcdef1234"), "…1234");
        assert_eq!(mask_key("abc"), "…abc");
    }

    async fn seeded_project(
        store: &MemoryStore,
        plan: Plan,
        custom_threshold: Option<u8>,
    ) -> Project {
        let tenant = store.create_tenant(plan).await.unwrap();
        store
            .create_project(Project {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                semantic_cache_threshold: 0.85,
                cache_ttl: CacheTtl::Seconds(3600),
                cache_ttl_overrides: HashMap::new(),
                cost_alert_threshold: custom_threshold,
                cost_alerts_enabled: true,
            })
            .await
            .unwrap()
    }

    struct CountingDispatcher(AtomicU32);

    impl AlertDispatcher for CountingDispatcher {
        fn dispatch(&self, _: Uuid, _: u8, _: u64, _: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sweep_fires_once_per_threshold_within_band() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaTracker::new();
        let telemetry = TelemetryQueue::new(100);
        let dispatcher = CountingDispatcher(AtomicU32::new(0));
        let now = Utc::now();

        // Free plan: 1000/month. Burn 520 units: 52% is inside the 50..55 band.
        let project = seeded_project(&store, Plan::Free, None).await;
        for _ in 0..520 {
            quota.check_and_reserve(project.id, u64::MAX, now);
        }

        let store_dyn: Arc<dyn GatewayStore> = store.clone();
        let fired = cost_alerts_sweep(
            &store_dyn,
            &quota,
            &telemetry,
            &dispatcher,
            EnvKind::Development,
            now,
        )
        .await
        .unwrap();
        assert_eq!(fired, 1);
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 1);
        assert_eq!(telemetry.len(), 1);

        // The same sweep again is a no-op: the triple is recorded.
        let fired = cost_alerts_sweep(
            &store_dyn,
            &quota,
            &telemetry,
            &dispatcher,
            EnvKind::Development,
            now,
        )
        .await
        .unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn sweep_skips_usage_outside_the_band() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaTracker::new();
        let telemetry = TelemetryQueue::new(100);
        let dispatcher = CountingDispatcher(AtomicU32::new(0));
        let now = Utc::now();

        // 60% is past the 50–55 band and below the 75 threshold.
        let project = seeded_project(&store, Plan::Free, None).await;
        for _ in 0..600 {
            quota.check_and_reserve(project.id, u64::MAX, now);
        }

        let store_dyn: Arc<dyn GatewayStore> = store.clone();
        let fired = cost_alerts_sweep(
            &store_dyn,
            &quota,
            &telemetry,
            &dispatcher,
            EnvKind::Development,
            now,
        )
        .await
        .unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn sweep_honors_the_custom_threshold() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaTracker::new();
        let telemetry = TelemetryQueue::new(100);
        let dispatcher = CountingDispatcher(AtomicU32::new(0));
        let now = Utc::now();

        // Custom threshold at 30%; usage at 32%.
        let project = seeded_project(&store, Plan::Free, Some(30)).await;
        for _ in 0..320 {
            quota.check_and_reserve(project.id, u64::MAX, now);
        }

        let store_dyn: Arc<dyn GatewayStore> = store.clone();
        let fired = cost_alerts_sweep(
            &store_dyn,
            &quota,
            &telemetry,
            &dispatcher,
            EnvKind::Development,
            now,
        )
        .await
        .unwrap();
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn ttl_recommendation_reacts_to_stale_hits() {
        use crate::cache::CacheEntry;

        let index: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::new());
        let project_id = Uuid::new_v4();

        // An old entry carrying most of the hits.
        let mut old = CacheEntry {
            fingerprint: "old".to_string(),
            project_id,
            endpoint_path: "/v1/chat/completions".to_string(),
            provider: "openai".to_string(),
            model: "m-1".to_string(),
            prompt_embedding: None,
            canonical_response: serde_json::json!({}),
            prompt_tokens: 1,
            completion_tokens: 1,
            cost_microcents: None,
            created_at: Utc::now() - chrono::Duration::days(3),
            expires_at: None,
            hit_count: 40,
        };
        index.put(old.clone()).await.unwrap();
        old.fingerprint = "fresh".to_string();
        old.created_at = Utc::now();
        old.hit_count = 10;
        index.put(old).await.unwrap();

        let rec = ttl_recommendation(&index, project_id, CacheTtl::Seconds(7_200))
            .await
            .unwrap()
            .expect("stale hits above 30%");
        assert_eq!(rec.recommended, CacheTtl::Seconds(14_400));
        assert!(rec.stale_hit_pct > 30.0);
    }
}
