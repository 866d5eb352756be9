//! Ephemeral rate and quota counters.
//!
//! Rate buckets are per-gateway-key minute windows; quota counters are
//! per-project month counters. Both use atomic increment-then-compare so
//! concurrent requests never double-admit past a limit.

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Buckets linger for the window plus this grace, then are pruned.
const BUCKET_GRACE_SECS: u64 = 120;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests remaining in the current window after this one.
    pub remaining: u32,
    /// Seconds until the window resets, in `[0, 60]`.
    pub reset_secs: u64,
    /// Epoch second the window resets at.
    pub reset_at: i64,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch second the month rolls over at.
    pub reset_at: i64,
}

/// Fixed-window per-minute rate limiter.
pub struct RateLimiter {
    buckets: DashMap<(Uuid, u64), Arc<AtomicI64>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Atomically count this request against the key's current minute
    /// window. The increment happens before the compare, so two racing
    /// requests can never both land on the last slot.
    pub fn check(&self, gateway_key_id: Uuid, limit: u32, now: DateTime<Utc>) -> RateDecision {
        let epoch = now.timestamp() as u64;
        let window = epoch / 60;
        let reset_secs = 60 - (epoch % 60);
        let reset_at = ((window + 1) * 60) as i64;

        let counter = self
            .buckets
            .entry((gateway_key_id, window))
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;

        let allowed = count <= limit as i64;
        let remaining = (limit as i64 - count).max(0) as u32;
        RateDecision {
            allowed,
            limit,
            remaining,
            reset_secs,
            reset_at,
        }
    }

    /// Drop buckets past their window plus grace.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = (now.timestamp() as u64).saturating_sub(BUCKET_GRACE_SECS) / 60;
        self.buckets.retain(|(_, window), _| *window >= cutoff);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Year-month key as `yyyymm`, UTC.
pub fn year_month(now: DateTime<Utc>) -> u32 {
    now.year() as u32 * 100 + now.month()
}

fn month_rollover_epoch(now: DateTime<Utc>) -> i64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

/// Monthly request quota tracker.
///
/// Reservation is one-way: a unit reserved for a request that later fails
/// stays charged. Quotas drift up by at most the concurrent-failure count,
/// which is cheaper than compensating decrements.
pub struct QuotaTracker {
    counters: DashMap<(Uuid, u32), Arc<AtomicU64>>,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    fn counter(&self, project_id: Uuid, ym: u32) -> Arc<AtomicU64> {
        self.counters
            .entry((project_id, ym))
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Check the month's count against the limit and reserve one unit when
    /// under it.
    pub fn check_and_reserve(
        &self,
        project_id: Uuid,
        limit: u64,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        let ym = year_month(now);
        let counter = self.counter(project_id, ym);
        let reset_at = month_rollover_epoch(now);

        let used = counter.load(Ordering::SeqCst);
        if used >= limit {
            return QuotaDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
            };
        }

        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count > limit {
            // Lost the race on the last slot.
            return QuotaDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
            };
        }

        QuotaDecision {
            allowed: true,
            limit,
            remaining: limit - count,
            reset_at,
        }
    }

    /// Month-to-date accepted requests for a project.
    pub fn month_to_date(&self, project_id: Uuid, now: DateTime<Utc>) -> u64 {
        self.counters
            .get(&(project_id, year_month(now)))
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Drop counters for months other than the current one.
    pub fn prune(&self, now: DateTime<Utc>) {
        let ym = year_month(now);
        self.counters.retain(|(_, month), _| *month == ym);
    }
}
