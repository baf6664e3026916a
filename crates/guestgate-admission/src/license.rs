//! License Gate
//!
//! Subscription tiers, the authoritative tier→limits table, and the
//! allow/deny decision for a requested operation.

use crate::tenant::{Subscription, SubscriptionStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Sentinel for "no ceiling" in [`TierLimits`].
pub const UNLIMITED: i64 = -1;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionTier {
    Free,
    Trial,
    Pro,
    Enterprise,
    /// Any tier name this build does not know. Always limited like `Free`.
    #[serde(other)]
    Unrecognized,
}

impl SubscriptionTier {
    /// Parse a tier name case-insensitively; unknown names map to
    /// [`SubscriptionTier::Unrecognized`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "trial" => Self::Trial,
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Trial => "Trial",
            Self::Pro => "Pro",
            Self::Enterprise => "Enterprise",
            Self::Unrecognized => "Unrecognized",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits granted by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Max external users (`-1` = unlimited)
    pub max_external_users: i64,
    /// Audit history retention in days (`-1` = unlimited)
    pub audit_history_days: i64,
    /// Request budget per rate-limit window
    pub requests_per_minute: u32,
    /// Custom policies and other advanced features
    pub advanced_features_enabled: bool,
}

impl TierLimits {
    /// Whether `current` existing resources leave room for one more.
    pub fn allows_another_external_user(&self, current: u64) -> bool {
        within_ceiling(self.max_external_users, current)
    }

    /// Whether `days` of audit history may be read.
    pub fn allows_audit_history(&self, days: u32) -> bool {
        match self.audit_history_days {
            UNLIMITED => true,
            ceiling if ceiling < 0 => false,
            ceiling => i64::from(days) <= ceiling,
        }
    }
}

// Only the exact sentinel means unlimited; any other negative is treated as
// a zero ceiling.
fn within_ceiling(ceiling: i64, current: u64) -> bool {
    match ceiling {
        UNLIMITED => true,
        c if c < 0 => false,
        c => current < c as u64,
    }
}

/// Authoritative tier→limits table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub free: TierLimits,
    pub trial: TierLimits,
    pub pro: TierLimits,
    pub enterprise: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits {
                max_external_users: 10,
                audit_history_days: 30,
                requests_per_minute: 50,
                advanced_features_enabled: false,
            },
            trial: TierLimits {
                max_external_users: 100,
                audit_history_days: 365,
                requests_per_minute: 200,
                advanced_features_enabled: true,
            },
            pro: TierLimits {
                max_external_users: 100,
                audit_history_days: 365,
                requests_per_minute: 200,
                advanced_features_enabled: true,
            },
            enterprise: TierLimits {
                max_external_users: UNLIMITED,
                audit_history_days: UNLIMITED,
                requests_per_minute: 1000,
                advanced_features_enabled: true,
            },
        }
    }
}

impl TierTable {
    /// Limits for a tier. Unrecognized tiers get `Free` limits.
    pub fn limits(&self, tier: SubscriptionTier) -> TierLimits {
        match tier {
            SubscriptionTier::Free | SubscriptionTier::Unrecognized => self.free,
            SubscriptionTier::Trial => self.trial,
            SubscriptionTier::Pro => self.pro,
            SubscriptionTier::Enterprise => self.enterprise,
        }
    }
}

/// Operation class assigned by the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Read,
    Write,
    CreateExternalUser,
    AdvancedFeature,
    AuditHistory,
}

/// Operation being authorized, with the usage data its checks need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedOperation {
    Read,
    Write,
    /// Invite/create one more external user
    CreateExternalUser { existing: u64 },
    /// Custom policies and other advanced features
    AdvancedFeature,
    /// Read audit history reaching `days` back
    ReadAuditHistory { days: u32 },
}

/// Machine-readable denial reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// Expired beyond the grace period
    SubscriptionExpired,
    /// Suspended or cancelled
    SubscriptionInactive,
    /// Tier does not include the feature
    FeatureNotAvailable,
    /// Tier ceiling reached
    QuotaExceeded,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            Self::SubscriptionInactive => "SUBSCRIPTION_INACTIVE",
            Self::FeatureNotAvailable => "FEATURE_NOT_AVAILABLE",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
        }
    }

    /// 402 when the remedy is paying, 403 when it is upgrading
    pub fn status(&self) -> u16 {
        match self {
            Self::SubscriptionExpired | Self::SubscriptionInactive => 402,
            Self::FeatureNotAvailable | Self::QuotaExceeded => 403,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::SubscriptionExpired => "Subscription has expired; renew to restore access",
            Self::SubscriptionInactive => "Subscription is suspended or cancelled",
            Self::FeatureNotAvailable => "This feature is not included in your subscription tier",
            Self::QuotaExceeded => "Your subscription tier limit has been reached",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// License decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseDecision {
    Allow,
    Deny(DenyReason),
}

impl LicenseDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// License gate
pub struct LicenseGate {
    tiers: Arc<TierTable>,
    grace_period: Duration,
}

impl LicenseGate {
    pub fn new(tiers: Arc<TierTable>, grace_period: Duration) -> Self {
        Self { tiers, grace_period }
    }

    /// Limits for a tier, from the authoritative table
    pub fn limits_for(&self, tier: SubscriptionTier) -> TierLimits {
        self.tiers.limits(tier)
    }

    /// Authorize an operation against the subscription as of now.
    pub fn authorize(
        &self,
        subscription: &Subscription,
        operation: RequestedOperation,
    ) -> LicenseDecision {
        self.authorize_at(subscription, operation, Utc::now())
    }

    /// Authorize an operation against the subscription as of `now`.
    pub fn authorize_at(
        &self,
        subscription: &Subscription,
        operation: RequestedOperation,
        now: DateTime<Utc>,
    ) -> LicenseDecision {
        if let Some(reason) = self.status_denial(subscription, now) {
            debug!(
                tenant_id = %subscription.tenant_id,
                status = ?subscription.status,
                %reason,
                "subscription state denies access"
            );
            return LicenseDecision::Deny(reason);
        }

        let limits = self.tiers.limits(subscription.tier);
        match operation {
            RequestedOperation::Read | RequestedOperation::Write => LicenseDecision::Allow,
            RequestedOperation::AdvancedFeature if !limits.advanced_features_enabled => {
                LicenseDecision::Deny(DenyReason::FeatureNotAvailable)
            }
            RequestedOperation::AdvancedFeature => LicenseDecision::Allow,
            RequestedOperation::CreateExternalUser { existing } => {
                if limits.allows_another_external_user(existing) {
                    LicenseDecision::Allow
                } else {
                    LicenseDecision::Deny(DenyReason::QuotaExceeded)
                }
            }
            RequestedOperation::ReadAuditHistory { days } => {
                if limits.allows_audit_history(days) {
                    LicenseDecision::Allow
                } else {
                    LicenseDecision::Deny(DenyReason::QuotaExceeded)
                }
            }
        }
    }

    fn status_denial(&self, subscription: &Subscription, now: DateTime<Utc>) -> Option<DenyReason> {
        match subscription.status {
            SubscriptionStatus::Active => None,
            // Trials get no grace period.
            SubscriptionStatus::Trial => match subscription.trial_expiry {
                Some(expiry) if now > expiry => Some(DenyReason::SubscriptionExpired),
                _ => None,
            },
            SubscriptionStatus::Expired => match subscription.end_date {
                Some(end) if now <= end + self.grace_period => None,
                _ => Some(DenyReason::SubscriptionExpired),
            },
            SubscriptionStatus::Suspended | SubscriptionStatus::Cancelled => {
                Some(DenyReason::SubscriptionInactive)
            }
        }
    }
}
