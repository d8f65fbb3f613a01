use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pin::ProtectedSurface;

/// PIN length is fixed; it is not a configuration option.
pub const PIN_LENGTH: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration, loaded from JSON. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrustConfig {
    pub pin: PinConfig,
    pub rate_limits: RateLimitConfig,
    pub keys: KeyConfig,
    pub device_link: DeviceLinkConfig,
    pub audit: AuditConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PinConfig {
    /// Consecutive failures before the gate blocks.
    pub failure_threshold: u32,
    /// Block durations in seconds; sorted ascending on use.
    pub block_tiers_secs: Vec<u64>,
    pub inactivity_timeout_secs: u64,
    pub unblock_poll_interval_ms: u64,
    pub protected_surfaces: Vec<ProtectedSurface>,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            block_tiers_secs: vec![30, 60, 300, 900, 3600],
            inactivity_timeout_secs: 300,
            unblock_poll_interval_ms: 1000,
            protected_surfaces: ProtectedSurface::ALL.to_vec(),
        }
    }
}

impl PinConfig {
    /// Block tiers in milliseconds, ascending.
    pub fn sorted_tiers_ms(&self) -> Vec<u64> {
        let mut tiers: Vec<u64> = self
            .block_tiers_secs
            .iter()
            .map(|secs| secs.saturating_mul(1000))
            .collect();
        tiers.sort_unstable();
        tiers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max_attempts: u32,
    pub block_duration_ms: u64,
}

impl RateLimitPolicy {
    pub const fn new(window_ms: u64, max_attempts: u32, block_duration_ms: u64) -> Self {
        Self {
            window_ms,
            max_attempts,
            block_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub search: RateLimitPolicy,
    pub device_link: RateLimitPolicy,
    pub bundle_fetch: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            search: RateLimitPolicy::new(60_000, 10, 60_000),
            device_link: RateLimitPolicy::new(300_000, 5, 900_000),
            bundle_fetch: RateLimitPolicy::new(60_000, 20, 300_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyConfig {
    /// Target size of the one-time prekey pool.
    pub one_time_prekey_pool_size: u32,
    /// Replenish once fewer than this many unused keys remain.
    pub replenish_below: u32,
    pub signed_prekey_max_age_secs: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_pool_size: 100,
            replenish_below: 20,
            signed_prekey_max_age_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceLinkConfig {
    pub request_ttl_secs: u64,
}

impl Default for DeviceLinkConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: 500 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    pub max_clock_skew_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
        }
    }
}

impl TrustConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pin.failure_threshold == 0 {
            return Err(ConfigError::Invalid("pin.failureThreshold must be at least 1".into()));
        }
        if self.pin.block_tiers_secs.is_empty() {
            return Err(ConfigError::Invalid("pin.blockTiersSecs must not be empty".into()));
        }
        if self.pin.unblock_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("pin.unblockPollIntervalMs must be positive".into()));
        }
        for (name, policy) in [
            ("search", &self.rate_limits.search),
            ("deviceLink", &self.rate_limits.device_link),
            ("bundleFetch", &self.rate_limits.bundle_fetch),
        ] {
            if policy.window_ms == 0 || policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rateLimits.{name} needs a positive window and maxAttempts"
                )));
            }
        }
        if self.keys.one_time_prekey_pool_size == 0 {
            return Err(ConfigError::Invalid("keys.oneTimePrekeyPoolSize must be positive".into()));
        }
        if self.keys.replenish_below > self.keys.one_time_prekey_pool_size {
            return Err(ConfigError::Invalid(
                "keys.replenishBelow cannot exceed the pool size".into(),
            ));
        }
        if self.device_link.request_ttl_secs == 0 {
            return Err(ConfigError::Invalid("deviceLink.requestTtlSecs must be positive".into()));
        }
        if self.audit.capacity == 0 {
            return Err(ConfigError::Invalid("audit.capacity must be positive".into()));
        }
        Ok(())
    }
}
