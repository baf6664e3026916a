//! Test support: fixture signing keys, JWKS documents, token minting and
//! collaborator doubles. Compiled for unit tests and behind the `testing`
//! feature for downstream crates.

use crate::audit::{AuditError, AuditRecord, AuditWriter, InMemoryAuditWriter};
use crate::config::AdmissionConfig;
use crate::keys::{InMemoryKeyStore, KeyError, KeySource};
use crate::license::{SubscriptionTier, TierTable};
use crate::pipeline::{AdmissionPipeline, AdmissionRequest, Collaborators};
use crate::ratelimit::InMemoryRateLimitStore;
use crate::tenant::{
    DirectoryError, DirectoryResult, InMemoryTenantDirectory, Subscription, SubscriptionRecord,
    SubscriptionStatus, Tenant, TenantDirectory, TenantId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_ISSUER: &str =
    "https://login.guestgate.test/7f3c2a10-0000-4000-8000-000000000001/v2.0";
pub const TEST_AUDIENCE: &str = "api://guestgate";

pub const PRIMARY_KEY_ID: &str = "gg-test-primary";
pub const ROTATED_KEY_ID: &str = "gg-test-rotated";

const PRIMARY_PEM: &[u8] = include_bytes!("../fixtures/signing_key_primary.pem");
const ROTATED_PEM: &[u8] = include_bytes!("../fixtures/signing_key_rotated.pem");

const PRIMARY_MODULUS: &str = concat!(
    "w3hfs8kWK9xaRUroiPH7EktHe7GEKwotrNwvzhU7CqcKutNdTABcpeYl_tbOP3lyeNBzQjbASpNm",
    "qhsagfVg_UzF_WiA_bNz8SA8jtkzzawWPbZ28qnmn6r864LINVy99Gvfz4Bz6QfsZKXTOo-lNuS4",
    "09A1Vm6yLgI4JZAgkQXleQq1E2nxZKCUPBYCkxL2F_0O_KEYOvkJWm6zMFSaBMmAMOZyRwIYzdJM",
    "Pq9wYMiNI3HvvqtepWGHH3yAO0cxpyWL4iBdEdGO3_JIG0tEhOjS0L02SI-dCp4gxcyVZI3KI9mx",
    "koR2mu1twv5E5F-KegTG_gZL-0iQIbdmzLMlpQ",
);
const ROTATED_MODULUS: &str = concat!(
    "nOV4qIjtyALxwB7ig1xOlOc5C4KBjyGpvxuTABiNMZ4sq3S1AsTiL278_xFMl9gN5IdCJaBP3a-4",
    "N3C85T-l2Fl3tgpd2GH7G-oO88erpAOtOAExhJxi0i33kFiqv559ZOcwXY6DFgCLORBDCzVRI2K9",
    "q3bS938SlwFYAeo8FVyvb6WINYeaEviWUaLPWSj_mkY941feYVI5_R-OkRWKdvwc4sIE1ljc3dE9",
    "jQ6H6QutPukQXka1nerLJpUIZc7yP_npxyphUXTzJBuGK_DWKMmqpJizhoiEiKCJwMSdala9D72j",
    "sY7RM3K_jsNfzjrLdEzJ-osbtirVX0M13V2zcQ",
);
const PUBLIC_EXPONENT: &str = "AQAB";

/// JWKS document publishing the given fixture key ids
pub fn jwks_json(key_ids: &[&str]) -> Value {
    let keys: Vec<Value> = key_ids
        .iter()
        .map(|kid| {
            let modulus = if *kid == ROTATED_KEY_ID { ROTATED_MODULUS } else { PRIMARY_MODULUS };
            json!({
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": kid,
                "n": modulus,
                "e": PUBLIC_EXPONENT,
            })
        })
        .collect();
    json!({ "keys": keys })
}

pub fn jwks(key_ids: &[&str]) -> JwkSet {
    serde_json::from_value(jwks_json(key_ids)).expect("fixture JWKS is valid")
}

/// Key source serving a mutable JWKS document from memory
pub struct StaticKeySource {
    jwks: Mutex<JwkSet>,
    fetches: AtomicUsize,
    latency: Option<std::time::Duration>,
    unavailable: AtomicBool,
}

impl StaticKeySource {
    pub fn new(jwks: JwkSet) -> Self {
        Self {
            jwks: Mutex::new(jwks),
            fetches: AtomicUsize::new(0),
            latency: None,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Delay every fetch
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replace the published document (key rotation)
    pub fn publish(&self, jwks: JwkSet) {
        *self.jwks.lock() = jwks;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeyError::KeyFetchFailed("connection refused".into()));
        }
        Ok(self.jwks.lock().clone())
    }
}

/// Mints tokens signed with the fixture keys
#[derive(Debug, Clone)]
pub struct TokenBuilder {
    key_id: String,
    claims: Map<String, Value>,
}

impl TokenBuilder {
    /// Valid for one hour, issued for [`TEST_AUDIENCE`] by [`TEST_ISSUER`]
    pub fn new(organization_id: &str) -> Self {
        let now = Utc::now();
        let mut claims = Map::new();
        claims.insert("iss".into(), json!(TEST_ISSUER));
        claims.insert("aud".into(), json!(TEST_AUDIENCE));
        claims.insert("tid".into(), json!(organization_id));
        claims.insert("oid".into(), json!("00000000-0000-4000-8000-0000000000aa"));
        claims.insert("email".into(), json!(format!("admin@{organization_id}.example")));
        claims.insert("iat".into(), json!(now.timestamp()));
        claims.insert("exp".into(), json!((now + Duration::hours(1)).timestamp()));

        Self {
            key_id: PRIMARY_KEY_ID.to_string(),
            claims,
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        self.claim("oid", subject)
    }

    pub fn email(self, email: &str) -> Self {
        self.claim("email", email)
    }

    pub fn without_email(self) -> Self {
        self.without_claim("email")
    }

    pub fn audience(self, audience: &str) -> Self {
        self.claim("aud", audience)
    }

    pub fn issuer(self, issuer: &str) -> Self {
        self.claim("iss", issuer)
    }

    pub fn roles(self, roles: &[&str]) -> Self {
        self.claim("roles", json!(roles))
    }

    /// Expiry relative to now; negative for an already expired token
    pub fn expires_in(self, lifetime: Duration) -> Self {
        self.claim("exp", (Utc::now() + lifetime).timestamp())
    }

    pub fn not_before(self, at: DateTime<Utc>) -> Self {
        self.claim("nbf", at.timestamp())
    }

    pub fn key_id(mut self, key_id: &str) -> Self {
        self.key_id = key_id.to_string();
        self
    }

    pub fn claim(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.claims.insert(name.to_string(), value.into());
        self
    }

    pub fn without_claim(mut self, name: &str) -> Self {
        self.claims.remove(name);
        self
    }

    /// RS256 with the fixture key for the key id. Unknown ids are signed
    /// with the primary key.
    pub fn sign(&self) -> String {
        let pem = if self.key_id == ROTATED_KEY_ID { ROTATED_PEM } else { PRIMARY_PEM };
        let key = EncodingKey::from_rsa_pem(pem).expect("fixture key is valid PEM");
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        encode(&header, &self.claims, &key).expect("token signs")
    }

    /// Symmetric token, for algorithm-confusion checks
    pub fn sign_hs256(&self, secret: &[u8]) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.key_id.clone());
        encode(&header, &self.claims, &EncodingKey::from_secret(secret)).expect("token signs")
    }
}

/// Subscription with default-table limits, started 30 days ago
pub fn subscription(tier: SubscriptionTier, status: SubscriptionStatus) -> Subscription {
    Subscription::from_record(
        SubscriptionRecord {
            tenant_id: Uuid::new_v4(),
            tier,
            status,
            start_date: Utc::now() - Duration::days(30),
            end_date: None,
            trial_expiry: None,
        },
        &TierTable::default(),
    )
}

/// Onboard an active tenant with a current subscription for `tier`.
/// Trials run for another 14 days.
pub fn onboard(
    directory: &InMemoryTenantDirectory,
    organization_id: &str,
    name: &str,
    tier: SubscriptionTier,
) -> Tenant {
    let tenant = Tenant::new(organization_id, name);
    let now = Utc::now();
    let (status, trial_expiry) = match tier {
        SubscriptionTier::Trial => (SubscriptionStatus::Trial, Some(now + Duration::days(14))),
        _ => (SubscriptionStatus::Active, None),
    };

    directory.insert_tenant(tenant.clone());
    directory.set_subscription(SubscriptionRecord {
        tenant_id: tenant.tenant_id,
        tier,
        status,
        start_date: now - Duration::days(30),
        end_date: None,
        trial_expiry,
    });
    tenant
}

/// Directory whose backing store is down
#[derive(Debug, Default, Clone, Copy)]
pub struct FlakyDirectory;

#[async_trait]
impl TenantDirectory for FlakyDirectory {
    async fn find_by_organization(
        &self,
        _organization_id: &str,
    ) -> DirectoryResult<Option<Tenant>> {
        Err(DirectoryError::Unavailable("connection reset by peer".into()))
    }

    async fn current_subscription(
        &self,
        _tenant_id: &TenantId,
    ) -> DirectoryResult<Option<SubscriptionRecord>> {
        Err(DirectoryError::Unavailable("connection reset by peer".into()))
    }

    async fn external_user_count(&self, _tenant_id: &TenantId) -> DirectoryResult<u64> {
        Err(DirectoryError::Unavailable("connection reset by peer".into()))
    }
}

/// Audit store that rejects every write
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingAuditWriter;

#[async_trait]
impl AuditWriter for FailingAuditWriter {
    async fn append(&self, _record: AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("audit table is read-only".into()))
    }
}

/// Audit store that never answers
#[derive(Debug, Default, Clone, Copy)]
pub struct StalledAuditWriter;

#[async_trait]
impl AuditWriter for StalledAuditWriter {
    async fn append(&self, _record: AuditRecord) -> Result<(), AuditError> {
        std::future::pending().await
    }
}

/// Fully wired in-memory pipeline
pub struct TestHarness {
    pub pipeline: Arc<AdmissionPipeline>,
    pub directory: Arc<InMemoryTenantDirectory>,
    pub keys: Arc<StaticKeySource>,
    pub audit: Arc<InMemoryAuditWriter>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    /// Valid config for the fixture issuer and audience, tenant cache off
    pub fn config() -> AdmissionConfig {
        let mut config = AdmissionConfig::default();
        config.identity.issuer = TEST_ISSUER.into();
        config.identity.audience = TEST_AUDIENCE.into();
        config.identity.jwks_url = "http://127.0.0.1:9/discovery/keys".into();
        config.tenant_cache.enabled = false;
        config
    }

    pub fn with_config(config: AdmissionConfig) -> Self {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        Self::build(config, directory.clone(), directory)
    }

    /// Pipeline reading tenants from `backend` instead of the in-memory
    /// directory
    pub fn with_directory(config: AdmissionConfig, backend: Arc<dyn TenantDirectory>) -> Self {
        Self::build(config, Arc::new(InMemoryTenantDirectory::new()), backend)
    }

    fn build(
        config: AdmissionConfig,
        directory: Arc<InMemoryTenantDirectory>,
        backend: Arc<dyn TenantDirectory>,
    ) -> Self {
        let keys = Arc::new(StaticKeySource::new(jwks(&[PRIMARY_KEY_ID, ROTATED_KEY_ID])));
        let audit = Arc::new(InMemoryAuditWriter::new());

        let pipeline = AdmissionPipeline::from_config(
            &config,
            Collaborators {
                key_source: keys.clone(),
                key_store: Arc::new(InMemoryKeyStore::new()),
                directory: backend,
                rate_limit_store: Arc::new(InMemoryRateLimitStore::new()),
                audit_writer: audit.clone(),
            },
        )
        .expect("test config is valid");

        Self {
            pipeline: Arc::new(pipeline),
            directory,
            keys,
            audit,
        }
    }

    pub fn onboard(&self, organization_id: &str, name: &str, tier: SubscriptionTier) -> Tenant {
        onboard(&self.directory, organization_id, name, tier)
    }

    /// Request carrying `token` as a bearer credential
    pub fn request(&self, method: &str, path: &str, token: &str) -> AdmissionRequest {
        AdmissionRequest::new(method, path).with_authorization(format!("Bearer {token}"))
    }
}
