//! Per-Tenant Rate Limiting
//!
//! Fixed-window counters keyed by tenant. The store is sharded so requests
//! for one tenant never contend with another tenant's counter.

use crate::tenant::TenantId;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Counter for one tenant's current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub tenant_id: TenantId,
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub limit: u32,
}

/// Rate limit check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs_at(Utc::now())
    }

    pub fn retry_after_secs_at(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }

    /// `X-RateLimit-*` (and `Retry-After` on denial) header pairs
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];

        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }

        headers
    }
}

/// Storage for per-tenant rate-limit windows.
pub trait RateLimitStore: Send + Sync {
    fn get(&self, tenant_id: &TenantId) -> Option<RateLimitState>;

    fn set(&self, state: RateLimitState);

    fn delete(&self, tenant_id: &TenantId);

    /// Reset the window if it has elapsed, then admit the request if the
    /// count is below `limit`, as one atomic step.
    fn consume(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision;
}

/// Sharded in-process store
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: DashMap<TenantId, RateLimitState>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked tenants
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn get(&self, tenant_id: &TenantId) -> Option<RateLimitState> {
        self.windows.get(tenant_id).map(|state| *state)
    }

    fn set(&self, state: RateLimitState) {
        self.windows.insert(state.tenant_id, state);
    }

    fn delete(&self, tenant_id: &TenantId) {
        self.windows.remove(tenant_id);
    }

    fn consume(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self.windows.entry(*tenant_id).or_insert_with(|| RateLimitState {
            tenant_id: *tenant_id,
            window_start: now,
            request_count: 0,
            limit,
        });
        let state = entry.value_mut();

        if now - state.window_start >= window {
            state.window_start = now;
            state.request_count = 0;
        }
        state.limit = limit;

        let allowed = state.request_count < limit;
        if allowed {
            state.request_count += 1;
        }

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(state.request_count),
            reset_at: state.window_start + window,
        }
    }
}

/// Fixed-window rate limiter
pub struct RateLimiter {
    store: std::sync::Arc<dyn RateLimitStore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: std::sync::Arc<dyn RateLimitStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Count one request against the tenant's current window.
    pub fn check_and_consume(&self, tenant_id: &TenantId, limit: u32) -> RateLimitDecision {
        self.check_and_consume_at(tenant_id, limit, Utc::now())
    }

    pub fn check_and_consume_at(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.store.consume(tenant_id, limit, self.window, now)
    }
}
