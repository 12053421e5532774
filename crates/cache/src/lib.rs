//! Image Loader Cache Library
//!
//! Two-tier image cache (memory LRU, persistent disk) coordinated with a
//! pool of reusable pixel buffers and driven by host memory pressure.

pub mod buffer;
pub mod config;
pub mod disk;
pub mod key;
pub mod memory;
pub mod pool;
pub mod pressure;

pub use buffer::{PixelFormat, PooledBuffer};
pub use config::{CacheConfig, ConfigError};
pub use disk::{DiskCache, DiskCacheStats};
pub use key::CacheKey;
pub use memory::{Eviction, EvictionCause, EvictionListener, MemoryCache, MemoryCacheStats};
pub use pool::{BufferPool, PoolStats};
pub use pressure::{
    FixedMemoryProbe, MemoryPressureMonitor, MemoryProbe, PressureLevel, PressureStats,
    SystemMemoryProbe,
};
