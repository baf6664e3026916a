//! Tenant Resolution
//!
//! Maps the identity provider's organization id to the internal tenant and
//! its current subscription through the [`TenantDirectory`] collaborator.

use crate::license::{SubscriptionTier, TierLimits, TierTable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Internal tenant ID
pub type TenantId = Uuid;

/// Tenant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    Active,
    Suspended,
    Cancelled,
}

/// Customer organization onboarded onto the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    /// Identity provider organization (directory) id
    pub organization_id: String,
    pub display_name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// New active tenant
    pub fn new(organization_id: &str, display_name: &str) -> Self {
        Self {
            tenant_id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            display_name: display_name.to_string(),
            status: TenantStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Trial,
    Expired,
    Suspended,
    Cancelled,
}

/// Subscription as stored by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub tenant_id: TenantId,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_expiry: Option<DateTime<Utc>>,
}

/// Subscription with limits derived from its tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub tenant_id: TenantId,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub trial_expiry: Option<DateTime<Utc>>,
    pub limits: TierLimits,
}

impl Subscription {
    /// Attach the tier's limits to a stored record
    pub fn from_record(record: SubscriptionRecord, tiers: &TierTable) -> Self {
        Self {
            limits: tiers.limits(record.tier),
            tenant_id: record.tenant_id,
            tier: record.tier,
            status: record.status,
            start_date: record.start_date,
            end_date: record.end_date,
            trial_expiry: record.trial_expiry,
        }
    }
}

/// Tenant and subscription resolved for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTenant {
    pub tenant: Tenant,
    pub subscription: Subscription,
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt directory record: {0}")]
    Corrupt(String),
}

/// Directory result type
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Tenant resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantError {
    #[error("organization {0} has not been onboarded")]
    NotOnboarded(String),

    #[error("tenant for organization {0} is not active")]
    Inactive(String),

    #[error("tenant for organization {0} has no subscription")]
    NoSubscription(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Tenant/subscription read API of the persistence layer
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Find the tenant onboarded for an identity provider organization
    async fn find_by_organization(&self, organization_id: &str) -> DirectoryResult<Option<Tenant>>;

    /// Current subscription for a tenant
    async fn current_subscription(
        &self,
        tenant_id: &TenantId,
    ) -> DirectoryResult<Option<SubscriptionRecord>>;

    /// Number of external users the tenant currently has
    async fn external_user_count(&self, tenant_id: &TenantId) -> DirectoryResult<u64>;
}

/// In-memory directory (for testing and development)
#[derive(Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<String, Tenant>>,
    subscriptions: RwLock<HashMap<TenantId, SubscriptionRecord>>,
    external_users: RwLock<HashMap<TenantId, u64>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tenant
    pub fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.organization_id.clone(), tenant);
    }

    /// Insert or replace a tenant's subscription
    pub fn set_subscription(&self, record: SubscriptionRecord) {
        self.subscriptions.write().insert(record.tenant_id, record);
    }

    /// Update a tenant's status
    pub fn set_tenant_status(&self, organization_id: &str, status: TenantStatus) {
        if let Some(tenant) = self.tenants.write().get_mut(organization_id) {
            tenant.status = status;
        }
    }

    pub fn set_external_user_count(&self, tenant_id: TenantId, count: u64) {
        self.external_users.write().insert(tenant_id, count);
    }

    /// Record one more external user, returning the new count
    pub fn add_external_user(&self, tenant_id: TenantId) -> u64 {
        let mut users = self.external_users.write();
        let count = users.entry(tenant_id).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn find_by_organization(&self, organization_id: &str) -> DirectoryResult<Option<Tenant>> {
        Ok(self.tenants.read().get(organization_id).cloned())
    }

    async fn current_subscription(
        &self,
        tenant_id: &TenantId,
    ) -> DirectoryResult<Option<SubscriptionRecord>> {
        Ok(self.subscriptions.read().get(tenant_id).cloned())
    }

    async fn external_user_count(&self, tenant_id: &TenantId) -> DirectoryResult<u64> {
        Ok(self.external_users.read().get(tenant_id).copied().unwrap_or(0))
    }
}

/// Tenant resolver with an optional short-lived cache keyed by
/// organization id
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
    tiers: Arc<TierTable>,
    cache: Option<Cache<String, ResolvedTenant>>,
}

impl TenantResolver {
    /// Resolver that hits the directory on every call
    pub fn new(directory: Arc<dyn TenantDirectory>, tiers: Arc<TierTable>) -> Self {
        Self {
            directory,
            tiers,
            cache: None,
        }
    }

    /// Absorb bursts with a cache of resolved tenants
    pub fn with_cache(mut self, ttl: Duration, max_entries: u64) -> Self {
        self.cache = Some(
            Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        );
        self
    }

    /// Resolve an organization to its active tenant and subscription.
    pub async fn resolve(&self, organization_id: &str) -> Result<ResolvedTenant, TenantError> {
        if let Some(cache) = &self.cache {
            if let Some(resolved) = cache.get(organization_id).await {
                debug!(organization_id, "tenant cache hit");
                return Self::check_active(resolved, organization_id);
            }
        }

        let tenant = self
            .directory
            .find_by_organization(organization_id)
            .await?
            .ok_or_else(|| TenantError::NotOnboarded(organization_id.to_string()))?;

        if !tenant.is_active() {
            return Err(TenantError::Inactive(organization_id.to_string()));
        }

        let record = self
            .directory
            .current_subscription(&tenant.tenant_id)
            .await?
            .ok_or_else(|| TenantError::NoSubscription(organization_id.to_string()))?;

        if record.tenant_id != tenant.tenant_id {
            return Err(DirectoryError::Corrupt(format!(
                "subscription for tenant {} returned for tenant {}",
                record.tenant_id, tenant.tenant_id
            ))
            .into());
        }

        let resolved = ResolvedTenant {
            subscription: Subscription::from_record(record, &self.tiers),
            tenant,
        };

        if let Some(cache) = &self.cache {
            cache.insert(organization_id.to_string(), resolved.clone()).await;
        }

        Ok(resolved)
    }

    /// Drop a cached entry after a subscription-changing operation
    pub async fn invalidate(&self, organization_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(organization_id).await;
        }
    }

    fn check_active(
        resolved: ResolvedTenant,
        organization_id: &str,
    ) -> Result<ResolvedTenant, TenantError> {
        if resolved.tenant.is_active() {
            Ok(resolved)
        } else {
            Err(TenantError::Inactive(organization_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{onboard, FlakyDirectory};

    fn resolver(directory: Arc<InMemoryTenantDirectory>) -> TenantResolver {
        TenantResolver::new(directory, Arc::new(TierTable::default()))
    }

    #[tokio::test]
    async fn test_resolves_onboarded_tenant() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let tenant = onboard(&directory, "org-contoso", "Contoso", SubscriptionTier::Pro);

        let resolved = resolver(directory).resolve("org-contoso").await.unwrap();

        assert_eq!(resolved.tenant.tenant_id, tenant.tenant_id);
        assert_eq!(resolved.subscription.tier, SubscriptionTier::Pro);
        assert_eq!(resolved.subscription.limits.max_external_users, 100);
    }

    #[tokio::test]
    async fn test_unknown_organization_is_not_onboarded() {
        let directory = Arc::new(InMemoryTenantDirectory::new());

        let err = resolver(directory).resolve("org-new").await.unwrap_err();
        assert_eq!(err, TenantError::NotOnboarded("org-new".into()));
    }

    #[tokio::test]
    async fn test_suspended_tenant_is_inactive() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        onboard(&directory, "org-fabrikam", "Fabrikam", SubscriptionTier::Free);
        directory.set_tenant_status("org-fabrikam", TenantStatus::Suspended);

        let err = resolver(directory).resolve("org-fabrikam").await.unwrap_err();
        assert_eq!(err, TenantError::Inactive("org-fabrikam".into()));
    }

    #[tokio::test]
    async fn test_missing_subscription() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        directory.insert_tenant(Tenant::new("org-orphan", "Orphan"));

        let err = resolver(directory).resolve("org-orphan").await.unwrap_err();
        assert_eq!(err, TenantError::NoSubscription("org-orphan".into()));
    }

    #[tokio::test]
    async fn test_directory_failure_is_propagated() {
        let directory = Arc::new(FlakyDirectory::default());
        let resolver = TenantResolver::new(directory, Arc::new(TierTable::default()));

        let err = resolver.resolve("org-any").await.unwrap_err();
        assert!(matches!(err, TenantError::Directory(DirectoryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_cache_invalidation_after_upgrade() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let tenant = onboard(&directory, "org-contoso", "Contoso", SubscriptionTier::Free);
        let resolver = resolver(directory.clone()).with_cache(Duration::from_secs(30), 1_000);

        let first = resolver.resolve("org-contoso").await.unwrap();
        assert_eq!(first.subscription.tier, SubscriptionTier::Free);

        let mut upgraded = directory
            .current_subscription(&tenant.tenant_id)
            .await
            .unwrap()
            .unwrap();
        upgraded.tier = SubscriptionTier::Enterprise;
        directory.set_subscription(upgraded);

        let cached = resolver.resolve("org-contoso").await.unwrap();
        assert_eq!(cached.subscription.tier, SubscriptionTier::Free);

        resolver.invalidate("org-contoso").await;
        let fresh = resolver.resolve("org-contoso").await.unwrap();
        assert_eq!(fresh.subscription.tier, SubscriptionTier::Enterprise);
        assert_eq!(fresh.subscription.limits.requests_per_minute, 1000);
    }
}
