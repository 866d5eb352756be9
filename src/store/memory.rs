//! In-memory store backed by concurrent maps.
//!
//! Single-node only. The provider-key invariants (≤3 active per
//! (project, provider), dense minimal priorities) are enforced under a
//! per-slice mutex so concurrent saves cannot overshoot the cap.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{GatewayStore, NewProviderKey, StoreError, UsageLogFilter};
use crate::models::{
    CacheFeedback, CacheTtl, GatewayKey, MAX_ACTIVE_PROVIDER_KEYS, Plan, Project, ProviderKey,
    ProviderKind, Tenant, UsageLogEntry,
};

#[derive(Default)]
pub struct MemoryStore {
    tenants: DashMap<Uuid, Tenant>,
    projects: DashMap<Uuid, Project>,
    gateway_keys: DashMap<Uuid, GatewayKey>,
    gateway_keys_by_hash: DashMap<String, Uuid>,
    provider_keys: DashMap<Uuid, ProviderKey>,
    /// Serializes mutations within one (project, provider) slice.
    provider_key_locks: DashMap<(Uuid, ProviderKind), ()>,
    usage_logs: Mutex<Vec<UsageLogEntry>>,
    feedback: Mutex<Vec<CacheFeedback>>,
    sent_alerts: DashMap<(Uuid, u32, u8), ()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_keys_sorted(&self, project_id: Uuid, provider: ProviderKind) -> Vec<ProviderKey> {
        let mut keys: Vec<ProviderKey> = self
            .provider_keys
            .iter()
            .filter(|k| k.project_id == project_id && k.provider == provider && k.is_active)
            .map(|k| k.clone())
            .collect();
        keys.sort_by_key(|k| k.priority);
        keys
    }

    /// Re-pack active priorities to `1..=n` preserving relative order.
    fn repack_priorities(&self, project_id: Uuid, provider: ProviderKind) {
        let keys = self.active_keys_sorted(project_id, provider);
        for (i, key) in keys.iter().enumerate() {
            if let Some(mut stored) = self.provider_keys.get_mut(&key.id) {
                stored.priority = (i + 1) as u8;
            }
        }
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn create_tenant(&self, plan: Plan) -> Result<Tenant, StoreError> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            plan,
        };
        self.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tenants.get(&id).map(|t| t.clone()))
    }

    async fn set_tenant_plan(&self, id: Uuid, plan: Plan) -> Result<(), StoreError> {
        let mut tenant = self.tenants.get_mut(&id).ok_or(StoreError::NotFound)?;
        tenant.plan = plan;
        Ok(())
    }

    async fn create_project(&self, project: Project) -> Result<Project, StoreError> {
        if !self.tenants.contains_key(&project.tenant_id) {
            return Err(StoreError::Invalid("tenant does not exist".to_string()));
        }
        self.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.get(&id).map(|p| p.clone()))
    }

    async fn projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.projects.iter().map(|p| p.clone()).collect())
    }

    async fn update_cache_ttl(
        &self,
        project_id: Uuid,
        default_ttl: CacheTtl,
        overrides: HashMap<String, CacheTtl>,
    ) -> Result<Project, StoreError> {
        let mut project = self
            .projects
            .get_mut(&project_id)
            .ok_or(StoreError::NotFound)?;
        project.cache_ttl = default_ttl;
        project.cache_ttl_overrides = overrides;
        Ok(project.clone())
    }

    async fn update_semantic_threshold(
        &self,
        project_id: Uuid,
        threshold: f64,
    ) -> Result<Project, StoreError> {
        let mut project = self
            .projects
            .get_mut(&project_id)
            .ok_or(StoreError::NotFound)?;
        project.semantic_cache_threshold = threshold;
        Ok(project.clone())
    }

    async fn create_gateway_key(
        &self,
        project_id: Uuid,
        hash: String,
    ) -> Result<GatewayKey, StoreError> {
        if !self.projects.contains_key(&project_id) {
            return Err(StoreError::Invalid("project does not exist".to_string()));
        }
        let key = GatewayKey {
            id: Uuid::new_v4(),
            project_id,
            hash: hash.clone(),
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.gateway_keys.insert(key.id, key.clone());
        self.gateway_keys_by_hash.insert(hash, key.id);
        Ok(key)
    }

    async fn gateway_key_by_hash(&self, hash: &str) -> Result<Option<GatewayKey>, StoreError> {
        Ok(self
            .gateway_keys_by_hash
            .get(hash)
            .and_then(|id| self.gateway_keys.get(&id))
            .map(|k| k.clone()))
    }

    async fn touch_gateway_key(&self, id: Uuid) -> Result<(), StoreError> {
        let mut key = self.gateway_keys.get_mut(&id).ok_or(StoreError::NotFound)?;
        key.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn deactivate_gateway_key(&self, id: Uuid) -> Result<(), StoreError> {
        let mut key = self.gateway_keys.get_mut(&id).ok_or(StoreError::NotFound)?;
        key.is_active = false;
        Ok(())
    }

    async fn save_provider_key(&self, new: NewProviderKey) -> Result<ProviderKey, StoreError> {
        if !self.projects.contains_key(&new.project_id) {
            return Err(StoreError::Invalid("project does not exist".to_string()));
        }

        // One writer per (project, provider) slice at a time.
        let slice = (new.project_id, new.provider);
        let guard = self.provider_key_locks.entry(slice).or_default();

        let active = self.active_keys_sorted(new.project_id, new.provider);
        if active.len() >= MAX_ACTIVE_PROVIDER_KEYS {
            drop(guard);
            return Err(StoreError::Conflict(format!(
                "at most {MAX_ACTIVE_PROVIDER_KEYS} active keys per provider"
            )));
        }

        let key = ProviderKey {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            provider: new.provider,
            encrypted_key: new.encrypted_key,
            iv: new.iv,
            priority: (active.len() + 1) as u8,
            is_active: true,
            name: new.name,
            last_used_at: None,
        };
        self.provider_keys.insert(key.id, key.clone());
        drop(guard);
        Ok(key)
    }

    async fn active_provider_keys(
        &self,
        project_id: Uuid,
        provider: ProviderKind,
    ) -> Result<Vec<ProviderKey>, StoreError> {
        Ok(self.active_keys_sorted(project_id, provider))
    }

    async fn list_provider_keys(&self, project_id: Uuid) -> Result<Vec<ProviderKey>, StoreError> {
        let mut keys: Vec<ProviderKey> = self
            .provider_keys
            .iter()
            .filter(|k| k.project_id == project_id)
            .map(|k| k.clone())
            .collect();
        keys.sort_by_key(|k| (k.provider.as_str(), k.priority));
        Ok(keys)
    }

    async fn delete_provider_key(&self, project_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
        let Some(key) = self.provider_keys.get(&id).map(|k| k.clone()) else {
            return Ok(false);
        };
        if key.project_id != project_id {
            return Ok(false);
        }

        let slice = (key.project_id, key.provider);
        let guard = self.provider_key_locks.entry(slice).or_default();
        self.provider_keys.remove(&id);
        self.repack_priorities(key.project_id, key.provider);
        drop(guard);
        Ok(true)
    }

    async fn touch_provider_key(&self, id: Uuid) -> Result<(), StoreError> {
        let mut key = self.provider_keys.get_mut(&id).ok_or(StoreError::NotFound)?;
        key.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_usage_log(&self, entry: UsageLogEntry) -> Result<(), StoreError> {
        self.usage_logs.lock().push(entry);
        Ok(())
    }

    async fn usage_logs(
        &self,
        project_id: Uuid,
        filter: &UsageLogFilter,
    ) -> Result<Vec<UsageLogEntry>, StoreError> {
        let logs = self.usage_logs.lock();
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        Ok(logs
            .iter()
            .filter(|l| l.project_id == project_id)
            .filter(|l| filter.status.is_none_or(|s| l.status == s))
            .filter(|l| filter.model.as_ref().is_none_or(|m| &l.model == m))
            .filter(|l| filter.from.is_none_or(|f| l.created_at >= f))
            .filter(|l| filter.to.is_none_or(|t| l.created_at < t))
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn add_feedback(&self, feedback: CacheFeedback) -> Result<(), StoreError> {
        self.feedback.lock().push(feedback);
        Ok(())
    }

    async fn feedback(&self, project_id: Uuid) -> Result<Vec<CacheFeedback>, StoreError> {
        Ok(self
            .feedback
            .lock()
            .iter()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn alert_sent(
        &self,
        project_id: Uuid,
        year_month: u32,
        threshold: u8,
    ) -> Result<bool, StoreError> {
        Ok(self
            .sent_alerts
            .contains_key(&(project_id, year_month, threshold)))
    }

    async fn record_alert(
        &self,
        project_id: Uuid,
        year_month: u32,
        threshold: u8,
    ) -> Result<(), StoreError> {
        self.sent_alerts
            .insert((project_id, year_month, threshold), ());
        Ok(())
    }
}
