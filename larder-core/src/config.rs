//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, LarderResult};

/// Default LMDB map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Default interval between active expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default name of the TTL cache partition.
pub const DEFAULT_CACHE_PARTITION: &str = "cache";

/// Default facade TTLs.
pub const DEFAULT_PRODUCTS_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_SESSIONS_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_PROFILES_TTL_SECS: u64 = 10 * 60;
pub const DEFAULT_REFERRALS_TTL_SECS: u64 = 60;
pub const DEFAULT_FLAGS_TTL_SECS: u64 = 15 * 60;

/// How the read-through cache treats a cached value whose TTL has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RevalidatePolicy {
    /// Serve any cached value regardless of age and refresh in the background.
    #[default]
    ServeStale,
    /// Serve only values within their TTL; an expired value forces the
    /// caller to await the fetcher, like a miss.
    WithinTtl,
}

impl FromStr for RevalidatePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serve-stale" | "serve_stale" | "stale" => Ok(RevalidatePolicy::ServeStale),
            "within-ttl" | "within_ttl" | "strict" => Ok(RevalidatePolicy::WithinTtl),
            other => Err(ConfigError::InvalidValue {
                field: "revalidate_policy".to_string(),
                value: other.to_string(),
                reason: "expected serve-stale or within-ttl".to_string(),
            }),
        }
    }
}

/// TTLs of the named domain cache facades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacadeTtls {
    pub products: Duration,
    pub sessions: Duration,
    pub profiles: Duration,
    pub referrals: Duration,
    pub flags: Duration,
}

impl Default for FacadeTtls {
    fn default() -> Self {
        Self {
            products: Duration::from_secs(DEFAULT_PRODUCTS_TTL_SECS),
            sessions: Duration::from_secs(DEFAULT_SESSIONS_TTL_SECS),
            profiles: Duration::from_secs(DEFAULT_PROFILES_TTL_SECS),
            referrals: Duration::from_secs(DEFAULT_REFERRALS_TTL_SECS),
            flags: Duration::from_secs(DEFAULT_FLAGS_TTL_SECS),
        }
    }
}

impl FacadeTtls {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LARDER_TTL_PRODUCTS_SECS` (default: 300)
    /// - `LARDER_TTL_SESSIONS_SECS` (default: 1800)
    /// - `LARDER_TTL_PROFILES_SECS` (default: 600)
    /// - `LARDER_TTL_REFERRALS_SECS` (default: 60)
    /// - `LARDER_TTL_FLAGS_SECS` (default: 900)
    pub fn from_env() -> Self {
        Self {
            products: env_secs("LARDER_TTL_PRODUCTS_SECS", DEFAULT_PRODUCTS_TTL_SECS),
            sessions: env_secs("LARDER_TTL_SESSIONS_SECS", DEFAULT_SESSIONS_TTL_SECS),
            profiles: env_secs("LARDER_TTL_PROFILES_SECS", DEFAULT_PROFILES_TTL_SECS),
            referrals: env_secs("LARDER_TTL_REFERRALS_SECS", DEFAULT_REFERRALS_TTL_SECS),
            flags: env_secs("LARDER_TTL_FLAGS_SECS", DEFAULT_FLAGS_TTL_SECS),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for the on-disk store. `None` keeps data in process memory.
    pub storage_path: Option<PathBuf>,
    /// Maximum size of the on-disk store in megabytes.
    pub map_size_mb: usize,
    /// Interval between active expiry sweeps.
    pub sweep_interval: Duration,
    /// Name of the TTL cache partition.
    pub cache_partition: String,
    /// Staleness policy of read-through caches.
    pub revalidate_policy: RevalidatePolicy,
    /// Facade TTLs.
    pub facade_ttls: FacadeTtls,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            map_size_mb: DEFAULT_MAP_SIZE_MB,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            cache_partition: DEFAULT_CACHE_PARTITION.to_string(),
            revalidate_policy: RevalidatePolicy::default(),
            facade_ttls: FacadeTtls::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create StoreConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `LARDER_STORAGE_PATH`: On-disk store directory (default: in-memory)
    /// - `LARDER_MAP_SIZE_MB`: LMDB map size (default: 64)
    /// - `LARDER_SWEEP_INTERVAL_SECS`: Expiry sweep interval (default: 300)
    /// - `LARDER_CACHE_PARTITION`: TTL cache partition name (default: cache)
    /// - `LARDER_REVALIDATE_POLICY`: `serve-stale` or `within-ttl` (default: serve-stale)
    /// - `LARDER_TTL_*_SECS`: facade TTLs, see [`FacadeTtls::from_env`]
    pub fn from_env() -> LarderResult<Self> {
        let defaults = Self::default();

        let revalidate_policy = match std::env::var("LARDER_REVALIDATE_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.revalidate_policy,
        };

        let config = Self {
            storage_path: std::env::var("LARDER_STORAGE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            map_size_mb: std::env::var("LARDER_MAP_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.map_size_mb),
            sweep_interval: env_secs("LARDER_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            cache_partition: std::env::var("LARDER_CACHE_PARTITION")
                .unwrap_or(defaults.cache_partition),
            revalidate_policy,
            facade_ttls: FacadeTtls::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the on-disk storage directory.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Set the LMDB map size.
    pub fn with_map_size_mb(mut self, mb: usize) -> Self {
        self.map_size_mb = mb;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the cache partition name.
    pub fn with_cache_partition(mut self, name: impl Into<String>) -> Self {
        self.cache_partition = name.into();
        self
    }

    /// Set the revalidate policy.
    pub fn with_revalidate_policy(mut self, policy: RevalidatePolicy) -> Self {
        self.revalidate_policy = policy;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - map_size_mb > 0
    /// - sweep_interval is positive
    /// - cache_partition is not empty
    pub fn validate(&self) -> LarderResult<()> {
        if self.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "map_size_mb".to_string(),
                value: self.map_size_mb.to_string(),
                reason: "map_size_mb must be greater than 0".to_string(),
            }
            .into());
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval".to_string(),
                value: format!("{:?}", self.sweep_interval),
                reason: "sweep_interval must be positive".to_string(),
            }
            .into());
        }

        if self.cache_partition.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache_partition".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

// =============================================================================
// TESTS
// =============================================================================
