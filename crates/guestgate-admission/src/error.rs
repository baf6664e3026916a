//! Admission error taxonomy
//!
//! Every stage reports a typed failure; the pipeline folds them into
//! [`AdmissionError`], which carries the stable machine-readable code and
//! HTTP status used by the response envelope.

use crate::audit::Stage;
use crate::license::DenyReason;
use crate::ratelimit::RateLimitDecision;
use crate::tenant::TenantError;
use crate::token::TokenError;
use thiserror::Error;

/// Broad category of an admission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing, invalid or expired credentials
    Authentication,
    /// Organization has not been onboarded
    Provisioning,
    /// Subscription state, feature or quota
    Entitlement,
    /// Per-tenant request budget exhausted
    RateLimit,
    /// Identity provider, persistence or a stage deadline failed
    Upstream,
    /// Caller went away before admission finished
    Cancelled,
}

/// Failures of external dependencies. These are operational incidents,
/// never user-caused denials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Signing keys could not be fetched from the identity provider
    #[error("identity provider key discovery failed: {0}")]
    KeyDiscovery(String),

    /// Tenant/subscription lookup failed
    #[error("tenant directory unavailable: {0}")]
    Directory(String),

    /// A stage exceeded its deadline
    #[error("{stage} did not complete within {timeout_ms}ms")]
    Timeout { stage: Stage, timeout_ms: u64 },

    /// The pipeline finished without assembling a full context
    #[error("incomplete request context: missing {0}")]
    IncompleteContext(&'static str),
}

/// Terminal outcome of a rejected request.
#[derive(Error, Debug, Clone)]
pub enum AdmissionError {
    /// Token verification failed
    #[error("authentication failed: {0}")]
    Unauthorized(TokenError),

    /// Organization unknown to the platform
    #[error("organization {organization_id} has not been onboarded")]
    TenantNotOnboarded { organization_id: String },

    /// Tenant exists but is suspended or cancelled
    #[error("tenant {organization_id} is not active")]
    TenantInactive { organization_id: String },

    /// Tenant has no current subscription
    #[error("tenant {organization_id} has no subscription")]
    NoSubscription { organization_id: String },

    /// License gate denied the operation
    #[error("license denied: {0}")]
    Denied(DenyReason),

    /// Rate limit exhausted for the current window
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),

    /// External dependency failed
    #[error(transparent)]
    Upstream(UpstreamError),

    /// Caller cancelled the request between stages
    #[error("request cancelled")]
    Cancelled,
}

impl AdmissionError {
    /// Error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized(_) | Self::TenantInactive { .. } => ErrorCategory::Authentication,
            Self::TenantNotOnboarded { .. } => ErrorCategory::Provisioning,
            Self::NoSubscription { .. } | Self::Denied(_) => ErrorCategory::Entitlement,
            Self::RateLimited(_) => ErrorCategory::RateLimit,
            Self::Upstream(_) => ErrorCategory::Upstream,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::TenantNotOnboarded { .. } => "TENANT_NOT_ONBOARDED",
            Self::TenantInactive { .. } => "TENANT_INACTIVE",
            Self::NoSubscription { .. } => "NO_SUBSCRIPTION",
            Self::Denied(reason) => reason.code(),
            Self::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            Self::Upstream(UpstreamError::Timeout { .. }) => "UPSTREAM_TIMEOUT",
            Self::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            Self::Cancelled => "REQUEST_CANCELLED",
        }
    }

    /// HTTP status code for the response envelope
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) | Self::TenantInactive { .. } => 401,
            Self::TenantNotOnboarded { .. } => 400,
            Self::NoSubscription { .. } => 402,
            Self::Denied(reason) => reason.status(),
            Self::RateLimited(_) => 429,
            Self::Upstream(UpstreamError::Timeout { .. }) => 504,
            Self::Upstream(_) => 503,
            Self::Cancelled => 499,
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Authentication failures share one generic message so a caller cannot
    /// learn which token check failed.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized(_) => "Authentication required".into(),
            Self::TenantInactive { .. } => "Tenant account is not active".into(),
            Self::TenantNotOnboarded { .. } => {
                "Organization is not onboarded; complete onboarding before calling the API".into()
            }
            Self::NoSubscription { .. } => "No subscription found for this organization".into(),
            Self::Denied(reason) => reason.message().into(),
            Self::RateLimited(decision) => format!(
                "Rate limit of {} requests per window exceeded; retry in {}s",
                decision.limit,
                decision.retry_after_secs()
            ),
            Self::Upstream(UpstreamError::Timeout { .. }) => {
                "A dependency did not respond in time".into()
            }
            Self::Upstream(_) => "A dependency is temporarily unavailable".into(),
            Self::Cancelled => "Request cancelled".into(),
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::RateLimit | ErrorCategory::Upstream)
    }
}

impl From<TokenError> for AdmissionError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::KeyUnavailable(detail) => {
                Self::Upstream(UpstreamError::KeyDiscovery(detail))
            }
            other => Self::Unauthorized(other),
        }
    }
}

impl From<TenantError> for AdmissionError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::NotOnboarded(organization_id) => {
                Self::TenantNotOnboarded { organization_id }
            }
            TenantError::Inactive(organization_id) => Self::TenantInactive { organization_id },
            TenantError::NoSubscription(organization_id) => {
                Self::NoSubscription { organization_id }
            }
            TenantError::Directory(e) => Self::Upstream(UpstreamError::Directory(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_failures_share_generic_message() {
        let expired = AdmissionError::from(TokenError::Expired);
        let tampered = AdmissionError::from(TokenError::SignatureInvalid);

        assert_eq!(expired.status(), 401);
        assert_eq!(expired.code(), tampered.code());
        assert_eq!(expired.public_message(), tampered.public_message());
    }

    #[test]
    fn test_key_unavailable_is_upstream() {
        let err = AdmissionError::from(TokenError::KeyUnavailable("connection refused".into()));

        assert_eq!(err.category(), ErrorCategory::Upstream);
        assert_eq!(err.status(), 503);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_provisioning_is_distinct() {
        let err = AdmissionError::from(TenantError::NotOnboarded("org-new".into()));

        assert_eq!(err.category(), ErrorCategory::Provisioning);
        assert_eq!(err.status(), 400);
        assert_eq!(err.code(), "TENANT_NOT_ONBOARDED");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_inactive_tenant_is_unauthorized() {
        let err = AdmissionError::from(TenantError::Inactive("org-1".into()));
        assert_eq!(err.status(), 401);
        assert_eq!(err.code(), "TENANT_INACTIVE");
    }

    #[test]
    fn test_entitlement_statuses() {
        assert_eq!(AdmissionError::Denied(DenyReason::SubscriptionExpired).status(), 402);
        assert_eq!(AdmissionError::Denied(DenyReason::SubscriptionInactive).status(), 402);
        assert_eq!(AdmissionError::Denied(DenyReason::FeatureNotAvailable).status(), 403);
        assert_eq!(AdmissionError::Denied(DenyReason::QuotaExceeded).status(), 403);
    }

    #[test]
    fn test_timeout_maps_to_gateway_timeout() {
        let err = AdmissionError::Upstream(UpstreamError::Timeout {
            stage: Stage::TenantResolver,
            timeout_ms: 3000,
        });
        assert_eq!(err.status(), 504);
        assert_eq!(err.code(), "UPSTREAM_TIMEOUT");
    }
}
