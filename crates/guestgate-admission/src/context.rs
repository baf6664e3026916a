//! Request context
//!
//! Stages fill a [`ContextBuilder`] one piece at a time; the pipeline turns it
//! into the immutable [`RequestContext`] handed to downstream handlers.

use crate::error::UpstreamError;
use crate::license::SubscriptionTier;
use crate::ratelimit::RateLimitDecision;
use crate::tenant::{ResolvedTenant, TenantId};
use crate::token::VerifiedIdentity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest inbound correlation id that is passed through
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// Identity and tenancy of an admitted request. The sole source of
/// tenant/user identity for handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub user_email: String,
    pub subscription_tier: SubscriptionTier,
    pub correlation_id: String,
    pub rate_limit_remaining: u32,
    pub roles: Vec<String>,
}

/// Partially assembled context passed from stage to stage
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    correlation_id: String,
    identity: Option<VerifiedIdentity>,
    tenant: Option<ResolvedTenant>,
    rate_limit: Option<RateLimitDecision>,
}

impl ContextBuilder {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            identity: None,
            tenant: None,
            rate_limit: None,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn identity(&self) -> Option<&VerifiedIdentity> {
        self.identity.as_ref()
    }

    pub fn tenant(&self) -> Option<&ResolvedTenant> {
        self.tenant.as_ref()
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant.as_ref().map(|t| t.tenant.tenant_id)
    }

    pub fn with_identity(mut self, identity: VerifiedIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_tenant(mut self, tenant: ResolvedTenant) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn with_rate_limit(mut self, decision: RateLimitDecision) -> Self {
        self.rate_limit = Some(decision);
        self
    }

    /// Freeze into a [`RequestContext`]. Fails if any stage was skipped.
    pub fn build(self) -> Result<(RequestContext, RateLimitDecision), UpstreamError> {
        let identity = self.identity.ok_or(UpstreamError::IncompleteContext("identity"))?;
        let resolved = self.tenant.ok_or(UpstreamError::IncompleteContext("tenant"))?;
        let rate_limit = self.rate_limit.ok_or(UpstreamError::IncompleteContext("rate limit"))?;

        let context = RequestContext {
            tenant_id: resolved.tenant.tenant_id,
            user_id: identity.subject_id,
            user_email: identity.email,
            subscription_tier: resolved.subscription.tier,
            correlation_id: self.correlation_id,
            rate_limit_remaining: rate_limit.remaining,
            roles: identity.roles,
        };
        Ok((context, rate_limit))
    }
}

/// Use the caller's correlation id when it is short visible ASCII,
/// otherwise mint a fresh one.
pub fn resolve_correlation_id(inbound: Option<&str>) -> String {
    match inbound.map(str::trim) {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_CORRELATION_ID_LEN
                && id.bytes().all(|b| b.is_ascii_graphic()) =>
        {
            id.to_string()
        }
        _ => Uuid::new_v4().to_string(),
    }
}
