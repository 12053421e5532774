//! Capacities and locations for the image caches.
//!
//! Built in code with the `with_*` methods, or read from `IMAGE_LOADER_*`
//! environment variables or a small `key = value` file.

use crate::disk::{DEFAULT_DISK_CACHE_SIZE, DEFAULT_EVICT_BATCH};
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::pressure::{default_memory_cache_kb, MemoryProbe, DEFAULT_LOW_MEMORY_RATIO};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default share of max usable memory given to the memory cache (1/8)
pub const DEFAULT_MEMORY_CACHE_DIVISOR: usize = 8;

/// Sizes of the memory cache, disk cache and buffer pool
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Memory cache capacity in KB; `None` derives it from host memory
    pub memory_cache_kb: Option<usize>,
    /// Max usable memory is divided by this to size the memory cache
    pub memory_cache_divisor: usize,
    /// Byte cap for files under `disk_cache_dir`
    pub disk_cache_size: u64,
    /// Where encoded cache files live; created on first use
    pub disk_cache_dir: PathBuf,
    /// Maximum number of buffers held by the pool
    pub pool_capacity: usize,
    /// Files removed per disk eviction pass
    pub disk_evict_batch: usize,
    /// Available/max ratio below which memory counts as low
    pub low_memory_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_kb: None,
            memory_cache_divisor: DEFAULT_MEMORY_CACHE_DIVISOR,
            disk_cache_size: DEFAULT_DISK_CACHE_SIZE,
            disk_cache_dir: Self::default_cache_dir(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            disk_evict_batch: DEFAULT_EVICT_BATCH,
            low_memory_ratio: DEFAULT_LOW_MEMORY_RATIO,
        }
    }
}

impl CacheConfig {
    /// Sets a fixed memory cache capacity in kilobytes.
    pub fn with_memory_kb(mut self, kb: usize) -> Self {
        self.memory_cache_kb = Some(kb);
        self
    }

    /// Sizes the memory cache as `max_usable / divisor`.
    pub fn with_memory_divisor(mut self, divisor: usize) -> Self {
        self.memory_cache_divisor = divisor.max(1);
        self
    }

    /// Disk cap in MB.
    pub fn with_disk_mb(mut self, mb: u64) -> Self {
        self.disk_cache_size = mb * 1024 * 1024;
        self
    }

    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_evict_batch(mut self, batch: usize) -> Self {
        self.disk_evict_batch = batch.max(1);
        self
    }

    pub fn with_low_memory_ratio(mut self, ratio: f64) -> Self {
        self.low_memory_ratio = ratio;
        self
    }

    /// Per-user cache directory, `image-loader/images` under the platform cache root.
    ///
    /// - macOS: ~/Library/Caches/image-loader/images
    /// - Linux: ~/.cache/image-loader/images
    /// - Windows: %LOCALAPPDATA%\image-loader\images
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("image-loader").join("images")
        } else {
            PathBuf::from("cache/images")
        }
    }

    /// Resolves the memory cache capacity in KB against a memory probe.
    pub fn resolve_memory_kb(&self, probe: &dyn MemoryProbe) -> usize {
        self.memory_cache_kb
            .unwrap_or_else(|| default_memory_cache_kb(probe, self.memory_cache_divisor))
    }

    /// Defaults overridden by whichever of these variables are set:
    /// - `IMAGE_LOADER_MEMORY_CACHE_KB`: memory cache size in KB
    /// - `IMAGE_LOADER_DISK_CACHE_MB`: disk cache size in MB (default: 50)
    /// - `IMAGE_LOADER_CACHE_DIR`: disk cache directory path
    /// - `IMAGE_LOADER_POOL_CAPACITY`: buffer pool size (default: 10)
    ///
    /// # Errors
    /// Fails with [`ConfigError::InvalidValue`] naming the first unparsable variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("IMAGE_LOADER_MEMORY_CACHE_KB") {
            config.memory_cache_kb = Some(parse_number("IMAGE_LOADER_MEMORY_CACHE_KB", &val)?);
        }

        if let Ok(val) = std::env::var("IMAGE_LOADER_DISK_CACHE_MB") {
            config.disk_cache_size =
                parse_number::<u64>("IMAGE_LOADER_DISK_CACHE_MB", &val)? * 1024 * 1024;
        }

        if let Ok(val) = std::env::var("IMAGE_LOADER_CACHE_DIR") {
            config.disk_cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("IMAGE_LOADER_POOL_CAPACITY") {
            config.pool_capacity = parse_number("IMAGE_LOADER_POOL_CAPACITY", &val)?;
        }

        Ok(config)
    }

    /// Read a config file. Keys not listed are ignored:
    /// ```toml
    /// memory_cache_kb = 65536
    /// disk_cache_mb = 50
    /// disk_cache_dir = "/path/to/cache"
    /// pool_capacity = 10
    /// disk_evict_batch = 10
    /// low_memory_ratio = 0.1
    /// ```
    ///
    /// # Errors
    /// Fails if the file is unreadable or a value does not parse.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;

        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');

                match key {
                    "memory_cache_kb" => config.memory_cache_kb = Some(parse_number(key, value)?),
                    "memory_cache_divisor" => {
                        config.memory_cache_divisor = parse_number::<usize>(key, value)?.max(1)
                    }
                    "disk_cache_mb" => {
                        config.disk_cache_size = parse_number::<u64>(key, value)? * 1024 * 1024
                    }
                    "disk_cache_dir" => config.disk_cache_dir = PathBuf::from(value),
                    "pool_capacity" => config.pool_capacity = parse_number(key, value)?,
                    "disk_evict_batch" => {
                        config.disk_evict_batch = parse_number::<usize>(key, value)?.max(1)
                    }
                    "low_memory_ratio" => config.low_memory_ratio = parse_number(key, value)?,
                    _ => {}
                }
            }
        }

        Ok(config)
    }

    /// Write the config in the format [`from_file`](Self::from_file) reads.
    ///
    /// # Errors
    /// Fails if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    fn to_toml(&self) -> String {
        let mut out = String::from("# Image Loader Cache Configuration\n");
        if let Some(kb) = self.memory_cache_kb {
            out.push_str(&format!("memory_cache_kb = {}\n", kb));
        }
        out.push_str(&format!(
            "memory_cache_divisor = {}\n\
             disk_cache_mb = {}\n\
             disk_cache_dir = \"{}\"\n\
             pool_capacity = {}\n\
             disk_evict_batch = {}\n\
             low_memory_ratio = {}\n",
            self.memory_cache_divisor,
            self.disk_cache_mb(),
            self.disk_cache_dir.display(),
            self.pool_capacity,
            self.disk_evict_batch,
            self.low_memory_ratio,
        ));
        out
    }

    pub fn disk_cache_mb(&self) -> u64 {
        self.disk_cache_size / (1024 * 1024)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

/// Failure to read or parse cache configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The named key or variable holds a value that does not parse
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
