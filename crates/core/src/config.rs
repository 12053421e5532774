//! Engine configuration
//!
//! Wraps the cache configuration with worker and network settings.

use image_loader_cache::{CacheConfig, ConfigError};
use image_loader_scheduler::DEFAULT_WORKER_COUNT;
use std::time::Duration;

/// Default connect and read timeout for network fetches
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`RequestEngine`](crate::RequestEngine)
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Cache capacities and locations
    pub cache: CacheConfig,
    /// Number of decode worker threads
    pub worker_count: usize,
    /// Network connect timeout
    pub connect_timeout: Duration,
    /// Network read timeout
    pub read_timeout: Duration,
    /// User-Agent header sent with network fetches
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            worker_count: DEFAULT_WORKER_COUNT,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            user_agent: format!("image-loader/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets both the connect and read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.read_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Reads everything [`CacheConfig::from_env`] reads, plus:
    /// - `IMAGE_LOADER_WORKERS`: worker thread count (default: 4)
    /// - `IMAGE_LOADER_TIMEOUT_SECS`: connect and read timeout (default: 10)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            cache: CacheConfig::from_env()?,
            ..Self::default()
        };

        if let Ok(val) = std::env::var("IMAGE_LOADER_WORKERS") {
            config.worker_count = val
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("IMAGE_LOADER_WORKERS".to_string()))?;
        }

        if let Ok(val) = std::env::var("IMAGE_LOADER_TIMEOUT_SECS") {
            let secs = val
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue("IMAGE_LOADER_TIMEOUT_SECS".to_string()))?;
            config = config.with_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }
}
