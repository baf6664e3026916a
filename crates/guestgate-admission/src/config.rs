//! Admission configuration
//!
//! Loaded from an optional TOML file layered under `GUESTGATE_*`
//! environment variables (nested keys separated by `__`), e.g.
//! `GUESTGATE_IDENTITY__AUDIENCE=api://guestgate`.

use crate::license::TierTable;
use crate::operation::OperationRules;
use crate::token::{ClaimNames, MAX_CLOCK_SKEW_SECS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file
pub const DEFAULT_CONFIG_FILE: &str = "guestgate.toml";

/// Longest configurable grace period
pub const MAX_GRACE_PERIOD_DAYS: i64 = 365;

/// Allowed per-stage deadline, in milliseconds
pub const STAGE_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 2_000..=5_000;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Admission pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub identity: IdentityProviderConfig,
    pub tenant_cache: TenantCacheConfig,
    pub rate_limit: RateLimitSettings,
    pub tiers: TierTable,
    pub operations: OperationRules,
    /// Per-stage deadline, clamped to 2..=5 seconds
    pub stage_timeout_ms: u64,
    /// How long an expired subscription keeps working
    pub grace_period_days: i64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            identity: IdentityProviderConfig::default(),
            tenant_cache: TenantCacheConfig::default(),
            rate_limit: RateLimitSettings::default(),
            tiers: TierTable::default(),
            operations: OperationRules::default(),
            stage_timeout_ms: 3_000,
            grace_period_days: 7,
        }
    }
}

/// Identity provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityProviderConfig {
    /// Key-discovery (JWKS) endpoint
    pub jwks_url: String,
    pub issuer: String,
    /// Audience every token must carry
    pub audience: String,
    pub clock_skew_secs: u64,
    pub key_cache_ttl_secs: u64,
    /// Minimum gap between fetches triggered by unknown key ids
    pub min_refresh_interval_secs: u64,
    pub fetch_timeout_ms: u64,
    pub claims: ClaimNames,
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            jwks_url: "https://login.microsoftonline.com/common/discovery/v2.0/keys".into(),
            issuer: String::new(),
            audience: String::new(),
            clock_skew_secs: MAX_CLOCK_SKEW_SECS,
            key_cache_ttl_secs: 86_400,
            min_refresh_interval_secs: 30,
            fetch_timeout_ms: 2_000,
            claims: ClaimNames::default(),
        }
    }
}

/// Tenant lookup cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for TenantCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 30,
            max_entries: 10_000,
        }
    }
}

/// Rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    /// Paths that skip admission entirely
    pub exempt_paths: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            exempt_paths: vec!["/health".into(), "/docs".into(), "/api-docs".into()],
        }
    }
}

impl AdmissionConfig {
    /// Load from `path` (missing file is fine) plus environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("GUESTGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.issuer.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.issuer must be set".into()));
        }
        if self.identity.audience.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.audience must be set".into()));
        }
        if self.identity.jwks_url.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.jwks_url must be set".into()));
        }
        if self.identity.clock_skew_secs > MAX_CLOCK_SKEW_SECS {
            return Err(ConfigError::Invalid(format!(
                "identity.clock_skew_secs must be at most {MAX_CLOCK_SKEW_SECS}"
            )));
        }
        if self.identity.key_cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "identity.key_cache_ttl_secs must be positive".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be positive".into()));
        }
        if !(0..=MAX_GRACE_PERIOD_DAYS).contains(&self.grace_period_days) {
            return Err(ConfigError::Invalid(format!(
                "grace_period_days must be between 0 and {MAX_GRACE_PERIOD_DAYS}"
            )));
        }
        Ok(())
    }

    /// Stage deadline, clamped into the allowed range
    pub fn stage_timeout(&self) -> Duration {
        let ms = self
            .stage_timeout_ms
            .clamp(*STAGE_TIMEOUT_RANGE_MS.start(), *STAGE_TIMEOUT_RANGE_MS.end());
        Duration::from_millis(ms)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.grace_period_days)
    }

    pub fn rate_limit_window(&self) -> chrono::Duration {
        seconds(self.rate_limit.window_secs)
    }

    pub fn key_cache_ttl(&self) -> chrono::Duration {
        seconds(self.identity.key_cache_ttl_secs)
    }

    pub fn key_refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.identity.min_refresh_interval_secs)
    }
}

// chrono panics past i64::MAX milliseconds
fn seconds(secs: u64) -> chrono::Duration {
    let capped = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1_000);
    chrono::Duration::seconds(capped)
}
