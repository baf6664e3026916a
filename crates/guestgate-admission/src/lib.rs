//! GuestGate Request Admission
//!
//! Every API request passes these checks, in order, before business logic
//! runs. Any stage can end the request; an admitted request carries an
//! immutable [`RequestContext`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ADMISSION PIPELINE                               │
//! │                                                                         │
//! │  Authorization: Bearer <jwt>        X-Correlation-ID                    │
//! │          │                                                              │
//! │  ┌───────▼────────┐  ┌────────────────┐  ┌─────────────┐  ┌──────────┐  │
//! │  │ Token Verifier │─▶│Tenant Resolver │─▶│License Gate │─▶│   Rate   │  │
//! │  │  (JWKS keys)   │  │  (directory)   │  │ (tier table)│  │ Limiter  │  │
//! │  └───────┬────────┘  └───────┬────────┘  └──────┬──────┘  └────┬─────┘  │
//! │          │                   │                  │              │        │
//! │  ┌───────▼───────────────────▼──────────────────▼──────────────▼─────┐  │
//! │  │                 AUDIT SINK (fire-and-forget)                      │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │          ▼ RequestContext { tenant, user, tier, correlation id }        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod license;
pub mod operation;
pub mod pipeline;
pub mod ratelimit;
pub mod stages;
pub mod tenant;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use audit::{
    AuditRecord, AuditSink, AuditWriter, InMemoryAuditWriter, Stage, TracingAuditWriter,
};
pub use config::{AdmissionConfig, ConfigError};
pub use context::RequestContext;
pub use error::{AdmissionError, ErrorCategory, UpstreamError};
pub use keys::{InMemoryKeyStore, JwksClient, KeyResolver, KeySource, KeyStore};
pub use license::{
    DenyReason, LicenseDecision, LicenseGate, SubscriptionTier, TierLimits, TierTable,
};
pub use pipeline::{Admission, AdmissionPipeline, AdmissionRequest, CancellationFlag, Collaborators};
pub use ratelimit::{InMemoryRateLimitStore, RateLimitDecision, RateLimiter};
pub use tenant::{InMemoryTenantDirectory, Tenant, TenantDirectory, TenantResolver};
pub use token::{TokenError, TokenVerifier, VerifiedIdentity};
