//! Per-model pricing catalog.
//!
//! Costs are stored in microcents (1/1,000,000 of a dollar) per 1M tokens to
//! keep the arithmetic in integers. The catalog is loaded once at startup and
//! can be hot-swapped by the admin surface.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::ProviderKind;

/// A pricing row is considered stale once its verification date is older
/// than this.
const STALE_AFTER_DAYS: i64 = 7;

/// Pricing for a single (provider, model) pair.
///
/// All rates are microcents per 1M tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input_per_1m_tokens: i64,
    pub output_per_1m_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_per_1m_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_input_per_1m_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_output_per_1m_tokens: Option<i64>,
    /// When the rates were last checked against the provider's price sheet.
    pub last_verified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Embedding models are priced on input tokens only.
    #[serde(default)]
    pub embedding: bool,
}

impl ModelPricing {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_verified_at > Duration::days(STALE_AFTER_DAYS)
    }

    /// Cost of a call in microcents.
    pub fn cost_microcents(&self, tokens_in: i64, tokens_out: i64) -> i64 {
        let output = if self.embedding {
            0
        } else {
            tokens_out.saturating_mul(self.output_per_1m_tokens)
        };
        (tokens_in.saturating_mul(self.input_per_1m_tokens) + output) / 1_000_000
    }
}

/// Convert microcents to dollars for display and the wire.
pub fn microcents_to_dollars(microcents: i64) -> f64 {
    microcents as f64 / 1_000_000.0
}

/// Convert a dollars-per-1M-tokens rate to microcents-per-1M.
pub fn dollars_per_1m_to_microcents(dollars: f64) -> i64 {
    (dollars * 1_000_000.0).round() as i64
}

/// Catalog of model pricing, keyed by (provider, model).
///
/// Reads take a shared lock; `replace` swaps the whole table, which is how
/// the admin surface hot-reloads prices.
pub struct PricingCatalog {
    rows: RwLock<HashMap<(ProviderKind, String), ModelPricing>>,
}

impl PricingCatalog {
    pub fn new(rows: HashMap<(ProviderKind, String), ModelPricing>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// A small built-in table so a fresh deployment prices the common models.
    pub fn with_defaults() -> Self {
        let now = Utc::now();
        let mut rows = HashMap::new();
        let row = |input: f64, output: f64| ModelPricing {
            input_per_1m_tokens: dollars_per_1m_to_microcents(input),
            output_per_1m_tokens: dollars_per_1m_to_microcents(output),
            last_verified_at: now,
            ..Default::default()
        };
        rows.insert(
            (ProviderKind::OpenAi, "gpt-4o".to_string()),
            row(2.50, 10.00),
        );
        rows.insert(
            (ProviderKind::OpenAi, "gpt-4o-mini".to_string()),
            row(0.15, 0.60),
        );
        rows.insert(
            (ProviderKind::OpenAi, "text-embedding-3-small".to_string()),
            ModelPricing {
                input_per_1m_tokens: dollars_per_1m_to_microcents(0.02),
                embedding: true,
                last_verified_at: now,
                ..Default::default()
            },
        );
        rows.insert(
            (ProviderKind::Anthropic, "claude-sonnet-4-5".to_string()),
            row(3.00, 15.00),
        );
        rows.insert(
            (ProviderKind::Groq, "llama-3.3-70b-versatile".to_string()),
            row(0.59, 0.79),
        );
        Self::new(rows)
    }

    pub fn get(&self, provider: ProviderKind, model: &str) -> Option<ModelPricing> {
        self.rows.read().get(&(provider, model.to_string())).cloned()
    }

    /// Cost of a call in microcents, or `None` when the model is unpriced.
    pub fn cost_microcents(
        &self,
        provider: ProviderKind,
        model: &str,
        tokens_in: i64,
        tokens_out: i64,
    ) -> Option<i64> {
        self.get(provider, model)
            .map(|p| p.cost_microcents(tokens_in, tokens_out))
    }

    /// Replace the whole table (hot reload).
    pub fn replace(&self, rows: HashMap<(ProviderKind, String), ModelPricing>) {
        let count = rows.len();
        *self.rows.write() = rows;
        tracing::info!(models = count, "pricing catalog reloaded");
    }

    /// Models whose pricing has not been verified within the staleness window.
    pub fn stale_models(&self, now: DateTime<Utc>) -> Vec<(ProviderKind, String)> {
        self.rows
            .read()
            .iter()
            .filter(|(_, p)| p.is_stale(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl std::fmt::Debug for PricingCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingCatalog")
            .field("models", &self.len())
            .finish()
    }
}
