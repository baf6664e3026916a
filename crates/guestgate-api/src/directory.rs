//! JSON-file tenant directory for local runs
//!
//! ```json
//! { "tenants": [ {
//!     "organization_id": "7f3c2a10-...", "display_name": "Contoso",
//!     "subscription": { "tier": "Pro", "status": "Active" },
//!     "external_users": 12
//! } ] }
//! ```

use chrono::{DateTime, Utc};
use guestgate_admission::tenant::{SubscriptionRecord, SubscriptionStatus, TenantStatus};
use guestgate_admission::{InMemoryTenantDirectory, SubscriptionTier, Tenant};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Directory seed errors
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read directory seed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid directory seed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("organization {0} appears more than once")]
    Duplicate(String),
}

#[derive(Debug, Deserialize)]
struct DirectorySeed {
    tenants: Vec<TenantSeed>,
}

#[derive(Debug, Deserialize)]
struct TenantSeed {
    organization_id: String,
    display_name: String,
    #[serde(default = "active")]
    status: TenantStatus,
    subscription: Option<SubscriptionSeed>,
    #[serde(default)]
    external_users: u64,
}

#[derive(Debug, Deserialize)]
struct SubscriptionSeed {
    tier: SubscriptionTier,
    status: SubscriptionStatus,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    trial_expiry: Option<DateTime<Utc>>,
}

fn active() -> TenantStatus {
    TenantStatus::Active
}

/// Load a directory seed file.
pub fn load_directory(path: &Path) -> Result<InMemoryTenantDirectory, SeedError> {
    let content = std::fs::read_to_string(path)?;
    let directory = parse_directory(&content)?;
    info!(path = %path.display(), "tenant directory loaded");
    Ok(directory)
}

/// Parse a directory seed document.
pub fn parse_directory(content: &str) -> Result<InMemoryTenantDirectory, SeedError> {
    let seed: DirectorySeed = serde_json::from_str(content)?;
    let directory = InMemoryTenantDirectory::new();
    let mut seen = std::collections::HashSet::new();

    for entry in seed.tenants {
        if !seen.insert(entry.organization_id.clone()) {
            return Err(SeedError::Duplicate(entry.organization_id));
        }

        let mut tenant = Tenant::new(&entry.organization_id, &entry.display_name);
        tenant.status = entry.status;

        if let Some(subscription) = entry.subscription {
            directory.set_subscription(SubscriptionRecord {
                tenant_id: tenant.tenant_id,
                tier: subscription.tier,
                status: subscription.status,
                start_date: subscription.start_date.unwrap_or(tenant.created_at),
                end_date: subscription.end_date,
                trial_expiry: subscription.trial_expiry,
            });
        }
        directory.set_external_user_count(tenant.tenant_id, entry.external_users);
        directory.insert_tenant(tenant);
    }

    Ok(directory)
}
