//! Gateway key authentication and the admission gate.
//!
//! The gate runs per request: resolve the bearer token to a key and project,
//! then apply the per-minute rate limit and the monthly quota in that order.
//! Rate and quota headers are emitted on every response, success or reject.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::{
    error::GatewayError,
    limits::{QuotaDecision, QuotaTracker, RateDecision, RateLimiter},
    models::{GatewayKey, PlanLimits, Project, Tenant},
    store::GatewayStore,
};

/// Everything the rest of the pipeline needs about an admitted request.
#[derive(Debug)]
pub struct Admission {
    pub gateway_key: GatewayKey,
    pub project: Project,
    pub tenant: Tenant,
    pub limits: PlanLimits,
    pub rate: RateDecision,
    pub quota: QuotaDecision,
}

impl Admission {
    /// Rate and quota headers, present on every gateway response.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let pairs: [(&str, String); 6] = [
            ("X-RateLimit-Limit", self.rate.limit.to_string()),
            ("X-RateLimit-Remaining", self.rate.remaining.to_string()),
            ("X-RateLimit-Reset", self.rate.reset_at.to_string()),
            ("X-Quota-Limit", self.quota.limit.to_string()),
            ("X-Quota-Remaining", self.quota.remaining.to_string()),
            ("X-Quota-Reset", self.quota.reset_at.to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(v) = HeaderValue::try_from(value) {
                headers.insert(name, v);
            }
        }
    }
}

/// Lowercase hex SHA-256 of a gateway secret.
pub fn hash_secret(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

/// Extract the bearer token from an Authorization header value.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the bearer token to its key, project, and tenant. Used by the
/// admission gate and, without the limit checks, by the admin surface.
pub async fn authenticate(
    store: &Arc<dyn GatewayStore>,
    headers: &HeaderMap,
) -> Result<(GatewayKey, Project, Tenant), GatewayError> {
    let token = bearer_token(headers).ok_or(GatewayError::Unauthorized)?;
    let hash = hash_secret(token);

    let gateway_key = store
        .gateway_key_by_hash(&hash)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .filter(|k| k.is_active)
        .ok_or(GatewayError::Unauthorized)?;

    let project = store
        .project(gateway_key.project_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .ok_or(GatewayError::Unauthorized)?;

    let tenant = store
        .tenant(project.tenant_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .ok_or(GatewayError::Unauthorized)?;

    Ok((gateway_key, project, tenant))
}

/// Run the full admission gate: authenticate, rate-check, quota-check.
pub async fn admit(
    store: &Arc<dyn GatewayStore>,
    limiter: &RateLimiter,
    quota: &QuotaTracker,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<Admission, GatewayError> {
    let (gateway_key, project, tenant) = authenticate(store, headers).await?;
    let limits = tenant.plan.limits();

    let rate = limiter.check(gateway_key.id, limits.requests_per_minute, now);
    if !rate.allowed {
        return Err(GatewayError::RateLimited {
            limit: rate.limit as u64,
            remaining: rate.remaining as u64,
            reset_at: rate.reset_at,
            retry_after: rate.reset_secs.max(1),
        });
    }

    let quota_decision = quota.check_and_reserve(project.id, limits.requests_per_month, now);
    if !quota_decision.allowed {
        return Err(GatewayError::QuotaExceeded {
            limit: quota_decision.limit,
            remaining: 0,
            reset_at: quota_decision.reset_at,
        });
    }

    if let Err(e) = store.touch_gateway_key(gateway_key.id).await {
        tracing::warn!(error = %e, key_id = %gateway_key.id, "failed to touch gateway key");
    }

    Ok(Admission {
        gateway_key,
        project,
        tenant,
        limits,
        rate,
        quota: quota_decision,
    })
}
