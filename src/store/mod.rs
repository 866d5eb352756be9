//! Gateway store: tenants, projects, keys, usage logs, feedback, and the
//! sent-alerts ledger.
//!
//! The trait is the seam; the in-memory implementation backs single-node
//! deployments and tests. A relational backend slots in behind the same
//! trait without touching callers.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;

use crate::models::{
    CacheFeedback, CacheTtl, GatewayKey, Plan, Project, ProviderKey, ProviderKind, Tenant,
    UsageLogEntry,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Fields for creating a provider key. Encryption happens before the store
/// sees the key; plaintext never lands here.
#[derive(Debug, Clone)]
pub struct NewProviderKey {
    pub project_id: Uuid,
    pub provider: ProviderKind,
    pub encrypted_key: String,
    pub iv: String,
    pub name: String,
}

/// Filter for paginated usage-log queries.
#[derive(Debug, Clone, Default)]
pub struct UsageLogFilter {
    pub status: Option<crate::models::RequestStatus>,
    pub model: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    // ── Tenants & projects ──────────────────────────────────────────────

    async fn create_tenant(&self, plan: Plan) -> Result<Tenant, StoreError>;

    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError>;

    async fn set_tenant_plan(&self, id: Uuid, plan: Plan) -> Result<(), StoreError>;

    async fn create_project(&self, project: Project) -> Result<Project, StoreError>;

    async fn project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;

    async fn projects(&self) -> Result<Vec<Project>, StoreError>;

    /// Update cache TTL settings. Validation of ranges and override keys
    /// happens in the admin surface before this is called.
    async fn update_cache_ttl(
        &self,
        project_id: Uuid,
        default_ttl: CacheTtl,
        overrides: HashMap<String, CacheTtl>,
    ) -> Result<Project, StoreError>;

    async fn update_semantic_threshold(
        &self,
        project_id: Uuid,
        threshold: f64,
    ) -> Result<Project, StoreError>;

    // ── Gateway keys ────────────────────────────────────────────────────

    /// Create a key for the given secret hash. The plaintext secret is the
    /// caller's to show once; only the hash persists.
    async fn create_gateway_key(
        &self,
        project_id: Uuid,
        hash: String,
    ) -> Result<GatewayKey, StoreError>;

    async fn gateway_key_by_hash(&self, hash: &str) -> Result<Option<GatewayKey>, StoreError>;

    async fn touch_gateway_key(&self, id: Uuid) -> Result<(), StoreError>;

    async fn deactivate_gateway_key(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Provider keys ───────────────────────────────────────────────────

    /// Save a provider key, enforcing at most three active keys per
    /// (project, provider) and assigning the next dense priority, atomically
    /// with respect to concurrent saves.
    async fn save_provider_key(&self, key: NewProviderKey) -> Result<ProviderKey, StoreError>;

    /// Active keys for a (project, provider), ordered by priority ascending.
    async fn active_provider_keys(
        &self,
        project_id: Uuid,
        provider: ProviderKind,
    ) -> Result<Vec<ProviderKey>, StoreError>;

    async fn list_provider_keys(&self, project_id: Uuid) -> Result<Vec<ProviderKey>, StoreError>;

    /// Delete a key and re-pack the remaining priorities so they stay dense
    /// and minimal. Returns false when the key does not exist.
    async fn delete_provider_key(&self, project_id: Uuid, id: Uuid) -> Result<bool, StoreError>;

    async fn touch_provider_key(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Usage logs ──────────────────────────────────────────────────────

    async fn insert_usage_log(&self, entry: UsageLogEntry) -> Result<(), StoreError>;

    async fn usage_logs(
        &self,
        project_id: Uuid,
        filter: &UsageLogFilter,
    ) -> Result<Vec<UsageLogEntry>, StoreError>;

    // ── Cache feedback ──────────────────────────────────────────────────

    async fn add_feedback(&self, feedback: CacheFeedback) -> Result<(), StoreError>;

    async fn feedback(&self, project_id: Uuid) -> Result<Vec<CacheFeedback>, StoreError>;

    // ── Sent cost alerts ────────────────────────────────────────────────

    /// Whether an alert for this (project, yyyymm, threshold) triple was
    /// already dispatched.
    async fn alert_sent(
        &self,
        project_id: Uuid,
        year_month: u32,
        threshold: u8,
    ) -> Result<bool, StoreError>;

    async fn record_alert(
        &self,
        project_id: Uuid,
        year_month: u32,
        threshold: u8,
    ) -> Result<(), StoreError>;
}
