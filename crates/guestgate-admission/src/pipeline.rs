//! Admission Pipeline
//!
//! One ordered list of stages. Each stage either hands an enriched
//! [`ContextBuilder`] to the next or ends the request with a typed
//! [`AdmissionError`]. Every decision is audited; cancellation is checked
//! before each stage and every stage runs under a deadline.

use crate::audit::{AuditSink, AuditWriter, Stage, PASSED};
use crate::config::{AdmissionConfig, ConfigError};
use crate::context::{resolve_correlation_id, ContextBuilder, RequestContext};
use crate::error::{AdmissionError, ErrorCategory, UpstreamError};
use crate::keys::{KeyResolver, KeySource, KeyStore};
use crate::license::LicenseGate;
use crate::ratelimit::{RateLimitDecision, RateLimitStore, RateLimiter};
use crate::stages::{LicenseStage, RateLimitStage, TenantStage, TokenStage};
use crate::tenant::{TenantDirectory, TenantId, TenantResolver};
use crate::token::TokenVerifier;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Cooperative cancellation signal shared with the caller
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Framework-independent view of an inbound request
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// Raw `X-Correlation-ID` header value
    pub correlation_id: Option<String>,
    pub cancellation: CancellationFlag,
}

impl AdmissionRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }
}

/// Result of one stage
#[derive(Debug)]
pub enum StageOutcome {
    Continue(ContextBuilder),
    Reject(AdmissionError),
}

/// One step of the pipeline
#[async_trait]
pub trait AdmissionStage: Send + Sync {
    /// Stage name used for audit records
    fn stage(&self) -> Stage;

    async fn run(&self, request: &AdmissionRequest, context: ContextBuilder) -> StageOutcome;
}

/// Terminal result of admission
#[derive(Debug)]
pub enum Admission {
    /// Path bypasses admission
    Exempt { correlation_id: String },
    Admitted {
        context: RequestContext,
        rate_limit: RateLimitDecision,
    },
    Rejected {
        error: AdmissionError,
        correlation_id: String,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// External collaborators the pipeline is wired to
pub struct Collaborators {
    pub key_source: Arc<dyn KeySource>,
    pub key_store: Arc<dyn KeyStore>,
    pub directory: Arc<dyn TenantDirectory>,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub audit_writer: Arc<dyn AuditWriter>,
}

/// Ordered admission stages plus audit
pub struct AdmissionPipeline {
    stages: Vec<Arc<dyn AdmissionStage>>,
    audit: AuditSink,
    exempt_paths: Vec<String>,
    stage_timeout: Duration,
    tenants: Option<Arc<TenantResolver>>,
}

impl AdmissionPipeline {
    /// Build the standard four-stage pipeline.
    pub fn from_config(
        config: &AdmissionConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let tiers = Arc::new(config.tiers.clone());
        let keys = Arc::new(
            KeyResolver::new(
                collaborators.key_source,
                collaborators.key_store,
                config.key_cache_ttl(),
            )
            .with_min_refresh_interval(config.key_refresh_cooldown()),
        );
        let verifier = Arc::new(TokenVerifier::new(
            keys,
            &config.identity.issuer,
            config.identity.claims.clone(),
            config.identity.clock_skew_secs,
        ));

        let mut resolver =
            TenantResolver::new(Arc::clone(&collaborators.directory), Arc::clone(&tiers));
        if config.tenant_cache.enabled {
            resolver = resolver.with_cache(
                Duration::from_secs(config.tenant_cache.ttl_secs),
                config.tenant_cache.max_entries,
            );
        }
        let resolver = Arc::new(resolver);

        let gate = Arc::new(LicenseGate::new(tiers, config.grace_period()));
        let limiter = Arc::new(RateLimiter::new(
            collaborators.rate_limit_store,
            config.rate_limit_window(),
        ));

        let stages: Vec<Arc<dyn AdmissionStage>> = vec![
            Arc::new(TokenStage::new(verifier, &config.identity.audience)),
            Arc::new(TenantStage::new(Arc::clone(&resolver))),
            Arc::new(LicenseStage::new(
                Arc::clone(&gate),
                Arc::new(config.operations.clone()),
                collaborators.directory,
            )),
            Arc::new(RateLimitStage::new(limiter, gate)),
        ];

        let mut pipeline = Self::from_stages(
            stages,
            AuditSink::new(collaborators.audit_writer).with_write_timeout(config.stage_timeout()),
            config.rate_limit.exempt_paths.clone(),
            config.stage_timeout(),
        );
        pipeline.tenants = Some(resolver);
        Ok(pipeline)
    }

    /// Assemble a pipeline from arbitrary stages.
    pub fn from_stages(
        stages: Vec<Arc<dyn AdmissionStage>>,
        audit: AuditSink,
        exempt_paths: Vec<String>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            stages,
            audit,
            exempt_paths,
            stage_timeout,
            tenants: None,
        }
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// The tenant resolver, for cache invalidation after subscription changes
    pub fn tenant_resolver(&self) -> Option<&Arc<TenantResolver>> {
        self.tenants.as_ref()
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths
            .iter()
            .any(|prefix| crate::operation::path_has_prefix(path, prefix))
    }

    /// Run the request through every stage.
    pub async fn admit(&self, request: AdmissionRequest) -> Admission {
        let correlation_id = resolve_correlation_id(request.correlation_id.as_deref());

        if self.is_exempt(&request.path) {
            debug!(%correlation_id, path = %request.path, "exempt path, skipping admission");
            return Admission::Exempt { correlation_id };
        }

        let span = info_span!(
            "admission",
            correlation_id = %correlation_id,
            method = %request.method,
            path = %request.path,
            tenant_id = tracing::field::Empty,
        );
        self.run(request, correlation_id).instrument(span).await
    }

    async fn run(&self, request: AdmissionRequest, correlation_id: String) -> Admission {
        let mut context = ContextBuilder::new(correlation_id.clone());

        for stage in &self.stages {
            let name = stage.stage();
            let tenant_id = context.tenant_id();

            if request.cancellation.is_cancelled() {
                return self.reject(name, tenant_id, &correlation_id, AdmissionError::Cancelled);
            }

            match tokio::time::timeout(self.stage_timeout, stage.run(&request, context)).await {
                Ok(StageOutcome::Continue(next)) => {
                    self.audit.record(&correlation_id, next.tenant_id(), name, PASSED, "");
                    context = next;
                }
                Ok(StageOutcome::Reject(e)) => {
                    return self.reject(name, tenant_id, &correlation_id, e);
                }
                Err(_) => {
                    let timeout = UpstreamError::Timeout {
                        stage: name,
                        timeout_ms: u64::try_from(self.stage_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    };
                    return self.reject(
                        name,
                        tenant_id,
                        &correlation_id,
                        AdmissionError::Upstream(timeout),
                    );
                }
            }
        }

        match context.build() {
            Ok((context, rate_limit)) => {
                info!(
                    tenant_id = %context.tenant_id,
                    user_id = %context.user_id,
                    tier = %context.subscription_tier,
                    remaining = rate_limit.remaining,
                    "request admitted"
                );
                Admission::Admitted { context, rate_limit }
            }
            Err(e) => {
                error!(error = %e, "pipeline finished without a complete context");
                Admission::Rejected {
                    error: AdmissionError::Upstream(e),
                    correlation_id,
                }
            }
        }
    }

    fn reject(
        &self,
        stage: Stage,
        tenant_id: Option<TenantId>,
        correlation_id: &str,
        rejection: AdmissionError,
    ) -> Admission {
        let code = rejection.code();
        self.audit
            .record(correlation_id, tenant_id, stage, code, rejection.to_string());

        match rejection.category() {
            ErrorCategory::Upstream => {
                error!(%stage, code, error = %rejection, "admission dependency failure")
            }
            _ => warn!(%stage, code, reason = %rejection, "request rejected"),
        }

        Admission::Rejected {
            error: rejection,
            correlation_id: correlation_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditWriter;
    use crate::license::{DenyReason, SubscriptionTier};
    use crate::tenant::TenantDirectory;
    use crate::testing::{TestHarness, TokenBuilder};

    fn admitted(admission: Admission) -> (RequestContext, RateLimitDecision) {
        match admission {
            Admission::Admitted { context, rate_limit } => (context, rate_limit),
            other => panic!("expected admission, got {other:?}"),
        }
    }

    fn rejected(admission: Admission) -> (AdmissionError, String) {
        match admission {
            Admission::Rejected { error, correlation_id } => (error, correlation_id),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_admits_valid_request() {
        let harness = TestHarness::new();
        let tenant = harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
        let token = TokenBuilder::new("org-contoso")
            .subject("user-7")
            .email("ana@contoso.com")
            .sign();

        let admission = harness
            .pipeline
            .admit(harness.request("GET", "/api/v1/folders", &token))
            .await;
        let (context, rate_limit) = admitted(admission);

        assert_eq!(context.tenant_id, tenant.tenant_id);
        assert_eq!(context.user_id, "user-7");
        assert_eq!(context.user_email, "ana@contoso.com");
        assert_eq!(context.subscription_tier, SubscriptionTier::Pro);
        assert_eq!(rate_limit.limit, 200);
        assert_eq!(context.rate_limit_remaining, 199);

        harness.pipeline.audit().flush().await;
        let records = harness.audit.for_correlation(&context.correlation_id);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.passed()));
    }

    #[tokio::test]
    async fn test_external_user_quota_on_pro() {
        let harness = TestHarness::new();
        let tenant = harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
        harness.directory.set_external_user_count(tenant.tenant_id, 99);
        let token = TokenBuilder::new("org-contoso").sign();

        let hundredth = harness
            .pipeline
            .admit(harness.request("POST", "/api/v1/external-users", &token))
            .await;
        assert!(hundredth.is_admitted());
        harness.directory.add_external_user(tenant.tenant_id);

        let admission = harness
            .pipeline
            .admit(harness.request("POST", "/api/v1/external-users", &token))
            .await;
        let (error, _) = rejected(admission);

        assert!(matches!(error, AdmissionError::Denied(DenyReason::QuotaExceeded)));
        assert_eq!(error.status(), 403);
    }

    #[tokio::test]
    async fn test_unknown_organization_is_audited_with_correlation_id() {
        let harness = TestHarness::new();
        let token = TokenBuilder::new("org-unknown").sign();
        let request = harness
            .request("GET", "/api/v1/folders", &token)
            .with_correlation_id("corr-onboarding-1");

        let (error, correlation_id) = rejected(harness.pipeline.admit(request).await);

        assert_eq!(error.code(), "TENANT_NOT_ONBOARDED");
        assert_eq!(error.status(), 400);
        assert_eq!(correlation_id, "corr-onboarding-1");

        harness.pipeline.audit().flush().await;
        let records = harness.audit.for_correlation("corr-onboarding-1");
        let last = records.last().unwrap();
        assert_eq!(last.stage, Stage::TenantResolver);
        assert_eq!(last.outcome, "TENANT_NOT_ONBOARDED");
    }

    #[tokio::test]
    async fn test_missing_token_short_circuits() {
        let harness = TestHarness::new();
        let request = AdmissionRequest::new("GET", "/api/v1/folders");
        let (error, _) = rejected(harness.pipeline.admit(request).await);

        assert_eq!(error.status(), 401);
        harness.pipeline.audit().flush().await;
        assert_eq!(harness.audit.records().len(), 1);
    }

    #[tokio::test]
    async fn test_free_tier_advanced_feature_denied() {
        let harness = TestHarness::new();
        harness.onboard("org-fabrikam", "Fabrikam", SubscriptionTier::Free);
        let token = TokenBuilder::new("org-fabrikam").sign();

        let (error, _) = rejected(
            harness
                .pipeline
                .admit(harness.request("POST", "/api/v1/policies", &token))
                .await,
        );
        assert!(matches!(error, AdmissionError::Denied(DenyReason::FeatureNotAvailable)));
    }

    #[tokio::test]
    async fn test_audit_history_beyond_retention() {
        let harness = TestHarness::new();
        harness.onboard("org-fabrikam", "Fabrikam", SubscriptionTier::Free);
        let token = TokenBuilder::new("org-fabrikam").sign();

        let within = harness
            .request("GET", "/api/v1/audit", &token)
            .with_query("days=30");
        assert!(harness.pipeline.admit(within).await.is_admitted());

        let beyond = harness
            .request("GET", "/api/v1/audit", &token)
            .with_query("days=31");
        let (error, _) = rejected(harness.pipeline.admit(beyond).await);
        assert!(matches!(error, AdmissionError::Denied(DenyReason::QuotaExceeded)));
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion() {
        let mut config = TestHarness::config();
        config.tiers.free.requests_per_minute = 2;
        let harness = TestHarness::with_config(config);
        harness.onboard("org-fabrikam", "Fabrikam", SubscriptionTier::Free);
        let token = TokenBuilder::new("org-fabrikam").sign();

        for _ in 0..2 {
            assert!(harness
                .pipeline
                .admit(harness.request("GET", "/api/v1/folders", &token))
                .await
                .is_admitted());
        }

        let (error, _) = rejected(
            harness
                .pipeline
                .admit(harness.request("GET", "/api/v1/folders", &token))
                .await,
        );
        match error {
            AdmissionError::RateLimited(decision) => {
                assert_eq!(decision.limit, 2);
                assert!(decision.retry_after_secs() >= 1);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exempt_paths_skip_every_stage() {
        let harness = TestHarness::new();

        let admission = harness.pipeline.admit(AdmissionRequest::new("GET", "/health")).await;

        assert!(matches!(admission, Admission::Exempt { .. }));
        assert!(harness.pipeline.is_exempt("/docs/index.html"));
        assert!(!harness.pipeline.is_exempt("/api/v1/me"));
        assert!(!harness.pipeline.is_exempt("/healthcheck"));
        harness.pipeline.audit().flush().await;
        assert!(harness.audit.records().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_visible_after_tenant_invalidation() {
        let mut config = TestHarness::config();
        config.tenant_cache.enabled = true;
        let harness = TestHarness::with_config(config);
        let tenant = harness.onboard("org-fabrikam", "Fabrikam", SubscriptionTier::Free);
        let token = TokenBuilder::new("org-fabrikam").sign();
        let policies = || harness.request("GET", "/api/v1/policies", &token);

        let (error, _) = rejected(harness.pipeline.admit(policies()).await);
        assert!(matches!(error, AdmissionError::Denied(DenyReason::FeatureNotAvailable)));

        let mut upgraded = harness
            .directory
            .current_subscription(&tenant.tenant_id)
            .await
            .unwrap()
            .unwrap();
        upgraded.tier = SubscriptionTier::Enterprise;
        harness.directory.set_subscription(upgraded);

        // Still served from the tenant cache
        assert!(!harness.pipeline.admit(policies()).await.is_admitted());

        let resolver = harness.pipeline.tenant_resolver().unwrap();
        resolver.invalidate("org-fabrikam").await;

        let (context, _) = admitted(harness.pipeline.admit(policies()).await);
        assert_eq!(context.subscription_tier, SubscriptionTier::Enterprise);
    }

    #[tokio::test]
    async fn test_forged_key_ids_do_not_hammer_provider() {
        let harness = TestHarness::new();
        harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
        let forged = TokenBuilder::new("org-contoso").key_id("forged-kid").sign();

        for _ in 0..10 {
            let admission = harness
                .pipeline
                .admit(harness.request("GET", "/api/v1/folders", &forged))
                .await;
            let (error, _) = rejected(admission);
            assert_eq!(error.status(), 401);
        }
        assert_eq!(harness.keys.fetch_count(), 1);

        let token = TokenBuilder::new("org-contoso").sign();
        let admission = harness
            .pipeline
            .admit(harness.request("GET", "/api/v1/folders", &token))
            .await;
        assert!(admission.is_admitted());
        assert_eq!(harness.keys.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_stage() {
        let harness = TestHarness::new();
        harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
        let flag = CancellationFlag::new();
        flag.cancel();

        let request = harness
            .request("GET", "/api/v1/folders", &TokenBuilder::new("org-contoso").sign())
            .with_cancellation(flag);
        let (error, _) = rejected(harness.pipeline.admit(request).await);

        assert!(matches!(error, AdmissionError::Cancelled));
    }

    struct StalledStage;

    #[async_trait]
    impl AdmissionStage for StalledStage {
        fn stage(&self) -> Stage {
            Stage::TenantResolver
        }

        async fn run(&self, _request: &AdmissionRequest, context: ContextBuilder) -> StageOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StageOutcome::Continue(context)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stage_times_out() {
        let writer = Arc::new(InMemoryAuditWriter::new());
        let pipeline = AdmissionPipeline::from_stages(
            vec![Arc::new(StalledStage)],
            AuditSink::new(writer.clone()),
            Vec::new(),
            Duration::from_secs(3),
        );

        let request = AdmissionRequest::new("GET", "/api/v1/folders");
        let (error, correlation_id) = rejected(pipeline.admit(request).await);

        assert_eq!(error.code(), "UPSTREAM_TIMEOUT");
        assert_eq!(error.status(), 504);
        pipeline.audit().flush().await;
        assert_eq!(writer.for_correlation(&correlation_id)[0].outcome, "UPSTREAM_TIMEOUT");
    }

    #[tokio::test]
    async fn test_incomplete_pipeline_is_rejected() {
        let pipeline = AdmissionPipeline::from_stages(
            Vec::new(),
            AuditSink::new(Arc::new(InMemoryAuditWriter::new())),
            Vec::new(),
            Duration::from_secs(3),
        );

        let request = AdmissionRequest::new("GET", "/api/v1/folders");
        let (error, _) = rejected(pipeline.admit(request).await);
        assert!(matches!(
            error,
            AdmissionError::Upstream(UpstreamError::IncompleteContext(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_outage_is_upstream() {
        let harness = TestHarness::with_directory(
            TestHarness::config(),
            Arc::new(crate::testing::FlakyDirectory),
        );
        let token = TokenBuilder::new("org-contoso").sign();

        let (error, _) = rejected(
            harness
                .pipeline
                .admit(harness.request("GET", "/api/v1/folders", &token))
                .await,
        );
        assert_eq!(error.status(), 503);
        assert!(error.is_retryable());
    }
}
