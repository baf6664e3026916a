//! The four admission stages, in pipeline order.

use crate::audit::Stage;
use crate::context::ContextBuilder;
use crate::error::{AdmissionError, UpstreamError};
use crate::license::{LicenseDecision, LicenseGate, OperationClass, RequestedOperation};
use crate::operation::{query_param, OperationRules};
use crate::pipeline::{AdmissionRequest, AdmissionStage, StageOutcome};
use crate::ratelimit::RateLimiter;
use crate::tenant::{TenantDirectory, TenantResolver};
use crate::token::TokenVerifier;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// History depth assumed when an audit read names no `days`
pub const DEFAULT_AUDIT_HISTORY_DAYS: u32 = 1;

/// Verifies the bearer token and records the caller's identity
pub struct TokenStage {
    verifier: Arc<TokenVerifier>,
    audience: String,
}

impl TokenStage {
    pub fn new(verifier: Arc<TokenVerifier>, audience: &str) -> Self {
        Self {
            verifier,
            audience: audience.to_string(),
        }
    }
}

#[async_trait]
impl AdmissionStage for TokenStage {
    fn stage(&self) -> Stage {
        Stage::TokenVerifier
    }

    async fn run(&self, request: &AdmissionRequest, context: ContextBuilder) -> StageOutcome {
        match self
            .verifier
            .verify(request.authorization.as_deref(), &self.audience)
            .await
        {
            Ok(identity) => StageOutcome::Continue(context.with_identity(identity)),
            Err(e) => StageOutcome::Reject(e.into()),
        }
    }
}

/// Maps the token's organization to a tenant and subscription
pub struct TenantStage {
    resolver: Arc<TenantResolver>,
}

impl TenantStage {
    pub fn new(resolver: Arc<TenantResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl AdmissionStage for TenantStage {
    fn stage(&self) -> Stage {
        Stage::TenantResolver
    }

    async fn run(&self, _request: &AdmissionRequest, context: ContextBuilder) -> StageOutcome {
        let Some(organization_id) = context.identity().map(|i| i.organization_id.clone()) else {
            return StageOutcome::Reject(AdmissionError::Upstream(
                UpstreamError::IncompleteContext("identity"),
            ));
        };

        match self.resolver.resolve(&organization_id).await {
            Ok(resolved) => {
                tracing::Span::current()
                    .record("tenant_id", tracing::field::display(resolved.tenant.tenant_id));
                StageOutcome::Continue(context.with_tenant(resolved))
            }
            Err(e) => StageOutcome::Reject(e.into()),
        }
    }
}

/// Authorizes the routed operation against the subscription
pub struct LicenseStage {
    gate: Arc<LicenseGate>,
    rules: Arc<OperationRules>,
    directory: Arc<dyn TenantDirectory>,
}

impl LicenseStage {
    pub fn new(
        gate: Arc<LicenseGate>,
        rules: Arc<OperationRules>,
        directory: Arc<dyn TenantDirectory>,
    ) -> Self {
        Self { gate, rules, directory }
    }
}

#[async_trait]
impl AdmissionStage for LicenseStage {
    fn stage(&self) -> Stage {
        Stage::LicenseGate
    }

    async fn run(&self, request: &AdmissionRequest, context: ContextBuilder) -> StageOutcome {
        let Some(resolved) = context.tenant() else {
            return StageOutcome::Reject(AdmissionError::Upstream(
                UpstreamError::IncompleteContext("tenant"),
            ));
        };

        let class = self.rules.classify(&request.method, &request.path);
        let operation = match class {
            OperationClass::Read => RequestedOperation::Read,
            OperationClass::Write => RequestedOperation::Write,
            OperationClass::AdvancedFeature => RequestedOperation::AdvancedFeature,
            OperationClass::AuditHistory => RequestedOperation::ReadAuditHistory {
                days: audit_days(request.query.as_deref()),
            },
            OperationClass::CreateExternalUser => {
                let tenant_id = &resolved.tenant.tenant_id;
                match self.directory.external_user_count(tenant_id).await {
                    Ok(existing) => RequestedOperation::CreateExternalUser { existing },
                    Err(e) => {
                        let failure = UpstreamError::Directory(e.to_string());
                        return StageOutcome::Reject(AdmissionError::Upstream(failure));
                    }
                }
            }
        };

        debug!(?operation, tier = %resolved.subscription.tier, "authorizing operation");
        let decision = self.gate.authorize(&resolved.subscription, operation);
        match decision {
            LicenseDecision::Allow => StageOutcome::Continue(context),
            LicenseDecision::Deny(reason) => StageOutcome::Reject(AdmissionError::Denied(reason)),
        }
    }
}

// An unparseable value asks for the maximum so only unlimited tiers pass.
fn audit_days(query: Option<&str>) -> u32 {
    match query_param(query, "days") {
        None => DEFAULT_AUDIT_HISTORY_DAYS,
        Some(value) => value.parse().unwrap_or(u32::MAX),
    }
}

/// Counts the request against the tenant's tier budget
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    gate: Arc<LicenseGate>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>, gate: Arc<LicenseGate>) -> Self {
        Self { limiter, gate }
    }
}

#[async_trait]
impl AdmissionStage for RateLimitStage {
    fn stage(&self) -> Stage {
        Stage::RateLimiter
    }

    async fn run(&self, _request: &AdmissionRequest, context: ContextBuilder) -> StageOutcome {
        let Some(resolved) = context.tenant() else {
            return StageOutcome::Reject(AdmissionError::Upstream(
                UpstreamError::IncompleteContext("tenant"),
            ));
        };

        let limit = self.gate.limits_for(resolved.subscription.tier).requests_per_minute;
        let decision = self.limiter.check_and_consume(&resolved.tenant.tenant_id, limit);

        if decision.allowed {
            StageOutcome::Continue(context.with_rate_limit(decision))
        } else {
            StageOutcome::Reject(AdmissionError::RateLimited(decision))
        }
    }
}
