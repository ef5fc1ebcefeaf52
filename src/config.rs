//! Configuration management for Bucketgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Main configuration for Bucketgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketgateConfig {
    /// Token bucket parameters shared by both limiter variants
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Shared store connection, used by the distributed limiter
    #[serde(default)]
    pub store: StoreConfig,

    /// In-process limiter settings
    #[serde(default)]
    pub local: LocalConfig,
}

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Maximum tokens a bucket holds, which is also the largest burst
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
        }
    }
}

fn default_rate() -> u32 {
    60
}

fn default_capacity() -> u32 {
    10
}

/// Connection parameters for the shared bucket store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Password, overriding any password embedded in the URL
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Prepended to every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-call timeout for script evaluation in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_response_timeout() -> u64 {
    1000
}

/// In-process limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// How often idle buckets are swept from memory; unset disables sweeping
    #[serde(default)]
    pub idle_sweep_interval_secs: Option<u64>,
}

impl LocalConfig {
    pub fn idle_sweep_interval(&self) -> Option<Duration> {
        self.idle_sweep_interval_secs.map(Duration::from_secs)
    }
}

impl BucketgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BucketgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.rate == 0 {
            return Err(LimiterError::Config("bucket.rate must be positive".to_string()));
        }
        if self.bucket.capacity == 0 {
            return Err(LimiterError::Config("bucket.capacity must be positive".to_string()));
        }
        if self.store.connect_timeout_ms == 0 || self.store.response_timeout_ms == 0 {
            return Err(LimiterError::Config("store timeouts must be positive".to_string()));
        }
        if self.local.idle_sweep_interval_secs == Some(0) {
            return Err(LimiterError::Config(
                "local.idle_sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
