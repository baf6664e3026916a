//! Signing Key Resolution
//!
//! Fetches the identity provider's JWKS document, caches the decoded keys by
//! key id, and refreshes the whole set on a miss or once a key outlives its
//! TTL. Concurrent misses share a single in-flight fetch.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Key resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// No key with this id, even after a refresh
    #[error("signing key not found: {0}")]
    KeyNotFound(String),

    /// Identity provider unreachable or returned garbage
    #[error("key fetch failed: {0}")]
    KeyFetchFailed(String),
}

/// One public signing key published by the identity provider.
#[derive(Clone)]
pub struct SigningKey {
    pub key_id: String,
    pub public_key: DecodingKey,
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

/// Immutable snapshot of every signing key from one fetch.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, Arc<SigningKey>>,
}

impl KeySet {
    /// Decode a JWKS document. Encryption keys, keys without a `kid`, and
    /// keys that fail to decode are skipped.
    pub fn from_jwks(jwks: &JwkSet, fetched_at: DateTime<Utc>) -> Self {
        let mut keys = HashMap::new();

        for jwk in &jwks.keys {
            let Some(key_id) = jwk.common.key_id.clone() else {
                debug!("skipping JWK without kid");
                continue;
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            match DecodingKey::from_jwk(jwk) {
                Ok(public_key) => {
                    keys.insert(
                        key_id.clone(),
                        Arc::new(SigningKey { key_id, public_key, fetched_at }),
                    );
                }
                Err(e) => warn!(key_id = %key_id, error = %e, "skipping undecodable JWK"),
            }
        }

        Self { keys }
    }

    pub fn get(&self, key_id: &str) -> Option<Arc<SigningKey>> {
        self.keys.get(key_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn without(&self, key_id: &str) -> Self {
        let mut keys = self.keys.clone();
        keys.remove(key_id);
        Self { keys }
    }
}

/// Storage for cached signing keys.
pub trait KeyStore: Send + Sync {
    /// Look up a cached key
    fn get(&self, key_id: &str) -> Option<Arc<SigningKey>>;

    /// Replace the whole cache with a freshly fetched set
    fn set(&self, keys: KeySet);

    /// Evict a single key
    fn delete(&self, key_id: &str);
}

/// Lock-free in-process key store; readers never block a refresh.
#[derive(Default)]
pub struct InMemoryKeyStore {
    current: ArcSwap<KeySet>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn get(&self, key_id: &str) -> Option<Arc<SigningKey>> {
        self.current.load().get(key_id)
    }

    fn set(&self, keys: KeySet) {
        self.current.store(Arc::new(keys));
    }

    fn delete(&self, key_id: &str) {
        self.current.rcu(|set| set.without(key_id));
    }
}

/// Where signing keys come from.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the provider's current key set
    async fn fetch(&self) -> Result<JwkSet, KeyError>;
}

/// JWKS endpoint client
pub struct JwksClient {
    client: reqwest::Client,
    url: String,
}

impl JwksClient {
    /// Create a client for the given key-discovery URL.
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, KeyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyError::KeyFetchFailed(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl KeySource for JwksClient {
    async fn fetch(&self) -> Result<JwkSet, KeyError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KeyError::KeyFetchFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| KeyError::KeyFetchFailed(e.to_string()))?;

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| KeyError::KeyFetchFailed(format!("invalid JWKS document: {e}")))
    }
}

type InflightRefresh = Shared<BoxFuture<'static, Result<usize, KeyError>>>;

/// Cached, single-flight signing key resolver
pub struct KeyResolver {
    source: Arc<dyn KeySource>,
    store: Arc<dyn KeyStore>,
    ttl: Duration,
    min_refresh_interval: std::time::Duration,
    inflight: Mutex<Option<InflightRefresh>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl KeyResolver {
    pub fn new(source: Arc<dyn KeySource>, store: Arc<dyn KeyStore>, ttl: Duration) -> Self {
        Self {
            source,
            store,
            ttl,
            min_refresh_interval: std::time::Duration::ZERO,
            inflight: Mutex::new(None),
            last_refresh: Mutex::new(None),
        }
    }

    /// Unknown key ids do not trigger another fetch until `interval` has
    /// passed since the last successful refresh.
    pub fn with_min_refresh_interval(mut self, interval: std::time::Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Resolve the public key for `key_id`, refreshing the cache at most
    /// once per call.
    pub async fn get_signing_key(&self, key_id: &str) -> Result<DecodingKey, KeyError> {
        let cached = self.store.get(key_id);
        match &cached {
            Some(key) if self.is_fresh(key) => return Ok(key.public_key.clone()),
            Some(_) => debug!(key_id, "signing key expired"),
            None if self.refreshed_recently() => {
                debug!(key_id, "unknown signing key, refresh throttled");
                return Err(KeyError::KeyNotFound(key_id.to_string()));
            }
            None => debug!(key_id, "signing key cache miss"),
        }

        self.refresh().await?;

        // Just fetched, so no TTL check.
        self.store
            .get(key_id)
            .map(|key| key.public_key.clone())
            .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))
    }

    /// Fetch the key set and replace the cache. Joins a refresh already in
    /// flight instead of starting a second one.
    pub async fn refresh(&self) -> Result<usize, KeyError> {
        let refresh = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let started = self.start_refresh();
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        let result = refresh.clone().await;
        if result.is_ok() {
            *self.last_refresh.lock() = Some(Instant::now());
        }

        let mut slot = self.inflight.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&refresh)) {
            *slot = None;
        }

        result
    }

    fn start_refresh(&self) -> InflightRefresh {
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);

        async move {
            let jwks = source.fetch().await.map_err(|e| {
                warn!(error = %e, "signing key refresh failed");
                e
            })?;
            let keys = KeySet::from_jwks(&jwks, Utc::now());
            let count = keys.len();
            store.set(keys);
            debug!(keys = count, "signing key cache refreshed");
            Ok(count)
        }
        .boxed()
        .shared()
    }

    fn is_fresh(&self, key: &SigningKey) -> bool {
        Utc::now() - key.fetched_at < self.ttl
    }

    fn refreshed_recently(&self) -> bool {
        self.last_refresh
            .lock()
            .is_some_and(|at| at.elapsed() < self.min_refresh_interval)
    }
}
