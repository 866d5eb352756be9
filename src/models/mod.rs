//! Core domain types shared across the gateway.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing plan for a tenant. Plans map to static request limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Pro,
}

/// Static per-plan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub requests_per_minute: u32,
    pub requests_per_month: u64,
}

impl Plan {
    pub fn limits(&self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                requests_per_minute: 10,
                requests_per_month: 1_000,
            },
            Plan::Starter => PlanLimits {
                requests_per_minute: 60,
                requests_per_month: 50_000,
            },
            Plan::Pro => PlanLimits {
                requests_per_minute: 600,
                requests_per_month: 1_000_000,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
        }
    }
}

/// A paying account. Projects belong to tenants; limits come from the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub plan: Plan,
}

/// Cache time-to-live. `Infinite` entries never expire.
///
/// On the wire a TTL is either a number of seconds or the string
/// `"infinite"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    Seconds(u64),
    Infinite,
}

impl Serialize for CacheTtl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CacheTtl::Seconds(secs) => serializer.serialize_u64(*secs),
            CacheTtl::Infinite => serializer.serialize_str("infinite"),
        }
    }
}

impl<'de> Deserialize<'de> for CacheTtl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(CacheTtl::Seconds)
                .ok_or_else(|| D::Error::custom("TTL seconds must be a non-negative integer")),
            serde_json::Value::String(s) if s == "infinite" => Ok(CacheTtl::Infinite),
            other => Err(D::Error::custom(format!(
                "TTL must be seconds or \"infinite\", got {other}"
            ))),
        }
    }
}

/// Inclusive bounds for a finite TTL: one minute to one year.
pub const MIN_TTL_SECS: u64 = 60;
pub const MAX_TTL_SECS: u64 = 31_536_000;

impl CacheTtl {
    /// Absolute expiry for an entry created at `now`, or `None` for infinite TTL.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CacheTtl::Infinite => None,
            CacheTtl::Seconds(secs) => Some(now + Duration::seconds(*secs as i64)),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            CacheTtl::Infinite => true,
            CacheTtl::Seconds(secs) => (MIN_TTL_SECS..=MAX_TTL_SECS).contains(secs),
        }
    }
}

/// Per-project gateway configuration.
///
/// The semantic threshold and TTLs drive the cache engine; cost alert fields
/// drive the scheduled alert sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Minimum cosine similarity for a semantic cache hit, in `[0.5, 0.99]`.
    pub semantic_cache_threshold: f64,
    /// Default TTL for cache entries.
    pub cache_ttl: CacheTtl,
    /// Per-endpoint TTL overrides, keyed by endpoint path.
    #[serde(default)]
    pub cache_ttl_overrides: HashMap<String, CacheTtl>,
    /// Custom alert threshold as a percentage of the monthly quota.
    pub cost_alert_threshold: Option<u8>,
    pub cost_alerts_enabled: bool,
}

impl Project {
    /// TTL for an endpoint: the override if present, else the project default.
    pub fn effective_ttl(&self, endpoint_path: &str) -> CacheTtl {
        self.cache_ttl_overrides
            .get(endpoint_path)
            .copied()
            .unwrap_or(self.cache_ttl)
    }
}

pub const MIN_SEMANTIC_THRESHOLD: f64 = 0.5;
pub const MAX_SEMANTIC_THRESHOLD: f64 = 0.99;

/// A project-scoped key presented by callers. Only the SHA-256 of the secret
/// is stored; the plaintext is shown once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayKey {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Lowercase hex SHA-256 of the secret.
    pub hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Upstream LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Groq,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "groq" => Some(ProviderKind::Groq),
            "openrouter" => Some(ProviderKind::OpenRouter),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum number of active provider keys per (project, provider).
pub const MAX_ACTIVE_PROVIDER_KEYS: usize = 3;

/// A customer-supplied provider credential, encrypted at rest.
///
/// `priority` is dense and minimal within the active keys of one
/// (project, provider) slice: active keys always hold `1..=n` with `n <= 3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKey {
    pub id: Uuid,
    pub project_id: Uuid,
    pub provider: ProviderKind,
    /// Base64 of `salt || ciphertext || tag`.
    pub encrypted_key: String,
    /// Base64 of the 12-byte AES-GCM nonce.
    pub iv: String,
    pub priority: u8,
    pub is_active: bool,
    pub name: String,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Terminal status of a gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
    Timeout,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Timeout => "timeout",
        }
    }
}

/// Append-only usage record for a single request.
///
/// Costs are stored in microcents (1/1,000,000 of a dollar) for precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub gateway_key_id: Uuid,
    pub provider: String,
    pub model: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub tokens_total: i64,
    /// Cost in microcents (1/1,000,000 of a dollar).
    pub cost_microcents: Option<i64>,
    /// Whether the response was served from the cache.
    pub cached: bool,
    /// Cosine similarity for semantic hits, `1.0` for exact hits.
    pub cache_similarity: Option<f64>,
    pub latency_ms: i64,
    pub endpoint_path: String,
    pub status: RequestStatus,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// End-user feedback on whether a semantic cache hit was accurate.
/// Consumed by the threshold recommender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFeedback {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Fingerprint of the cache entry the feedback refers to.
    pub cache_entry_fingerprint: String,
    pub accurate: bool,
    pub similarity_score: f64,
    pub created_at: DateTime<Utc>,
}
