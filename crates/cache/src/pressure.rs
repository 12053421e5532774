//! Memory pressure handling
//!
//! The host reports discrete pressure levels; the monitor translates each
//! signal into trim or clear actions on the memory cache and buffer pool.
//! It also answers point-in-time "is memory low" queries from a
//! [`MemoryProbe`], which the request engine uses to skip memory-cache
//! population while the host is short on memory.

use crate::memory::MemoryCache;
use crate::pool::BufferPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Pool size kept after a [`PressureLevel::Moderate`] signal
pub const MODERATE_POOL_SIZE: usize = 5;

/// Pool size kept after a [`PressureLevel::UiHidden`] signal
pub const UI_HIDDEN_POOL_SIZE: usize = 7;

/// Default fraction of total memory below which memory counts as low
pub const DEFAULT_LOW_MEMORY_RATIO: f64 = 0.10;

/// Max usable memory assumed when the host cannot report it
pub const DEFAULT_MAX_USABLE_BYTES: u64 = 512 * 1024 * 1024;

/// Host memory pressure level, ordered by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureLevel {
    /// No pressure
    #[default]
    Normal,
    /// The UI went out of view; cheap-to-rebuild memory can go
    UiHidden,
    /// Memory is getting scarce
    Moderate,
    /// The process is likely to be killed soon
    Critical,
}

impl PressureLevel {
    /// Map a numeric host trim level onto a pressure level
    ///
    /// Background levels (20 and up) are checked first; the running
    /// levels 5, 10 and 15 map to Moderate, Moderate and Critical.
    pub fn from_trim_level(level: u32) -> Self {
        match level {
            80.. => PressureLevel::Critical,
            60..=79 => PressureLevel::Moderate,
            20..=59 => PressureLevel::UiHidden,
            15..=19 => PressureLevel::Critical,
            5..=14 => PressureLevel::Moderate,
            _ => PressureLevel::Normal,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::UiHidden => "ui-hidden",
            PressureLevel::Moderate => "moderate",
            PressureLevel::Critical => "critical",
        }
    }
}

/// Source of host memory figures
pub trait MemoryProbe: Send + Sync {
    /// Maximum memory the process may use, in bytes
    fn max_usable_bytes(&self) -> Option<u64>;

    /// Memory currently available to the process, in bytes
    fn available_bytes(&self) -> Option<u64>;
}

/// Probe backed by operating system queries
///
/// `IMAGE_LOADER_MAX_MEMORY_MB` overrides the reported maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn max_usable_bytes(&self) -> Option<u64> {
        if let Ok(value) = std::env::var("IMAGE_LOADER_MAX_MEMORY_MB") {
            if let Ok(mb) = value.parse::<u64>() {
                return Some(mb.saturating_mul(1024 * 1024));
            }
        }
        system_total_ram_bytes()
    }

    fn available_bytes(&self) -> Option<u64> {
        system_available_ram_bytes()
    }
}

/// Probe with values set by the host, for embedders that track memory
/// themselves and for tests
#[derive(Debug)]
pub struct FixedMemoryProbe {
    max_usable: AtomicU64,
    available: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(max_usable: u64, available: u64) -> Self {
        Self {
            max_usable: AtomicU64::new(max_usable),
            available: AtomicU64::new(available),
        }
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn max_usable_bytes(&self) -> Option<u64> {
        Some(self.max_usable.load(Ordering::Relaxed))
    }

    fn available_bytes(&self) -> Option<u64> {
        Some(self.available.load(Ordering::Relaxed))
    }
}

/// Default memory cache capacity: one eighth of max usable memory, in KB
pub fn default_memory_cache_kb(probe: &dyn MemoryProbe, divisor: usize) -> usize {
    let max = probe.max_usable_bytes().unwrap_or(DEFAULT_MAX_USABLE_BYTES);
    (max / 1024) as usize / divisor.max(1)
}

#[cfg(target_os = "linux")]
fn sysinfo() -> Option<libc::sysinfo> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    Some(unsafe { info.assume_init() })
}

#[cfg(target_os = "linux")]
fn system_total_ram_bytes() -> Option<u64> {
    let info = sysinfo()?;
    Some((info.totalram as u64).saturating_mul(info.mem_unit as u64))
}

/// `MemAvailable` from a `/proc/meminfo` listing, in bytes
///
/// Unlike free RAM this counts reclaimable page cache, which is what the
/// kernel can hand out without swapping.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))?;
    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value.saturating_mul(1024)),
        Some(_) => None,
    }
}

#[cfg(target_os = "linux")]
fn system_available_ram_bytes() -> Option<u64> {
    if let Some(available) = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_mem_available(&meminfo))
    {
        return Some(available);
    }
    // Kernels before 3.14 have no MemAvailable
    let info = sysinfo()?;
    let free = (info.freeram as u64).saturating_add(info.bufferram as u64);
    Some(free.saturating_mul(info.mem_unit as u64))
}

#[cfg(target_os = "macos")]
fn system_total_ram_bytes() -> Option<u64> {
    use std::ffi::CString;
    use std::mem::size_of;
    use std::ptr;

    let key = CString::new("hw.memsize").ok()?;
    let mut value: u64 = 0;
    let mut len = size_of::<u64>();
    let result = unsafe {
        libc::sysctlbyname(
            key.as_ptr(),
            &mut value as *mut u64 as *mut libc::c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if result == 0 && len == size_of::<u64>() {
        Some(value)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn system_available_ram_bytes() -> Option<u64> {
    None
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn system_total_ram_bytes() -> Option<u64> {
    None
}

/// Counters describing the signals received so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PressureStats {
    /// Most recent level received
    pub current_level: PressureLevel,
    /// Total signals received
    pub signals: u64,
    /// Signals that cleared the cache and pool
    pub critical_signals: u64,
    /// When the most recent signal arrived
    pub last_signal: Option<Instant>,
}

/// Applies host memory pressure signals to the cache and pool
///
/// Effects are applied synchronously on the calling thread:
///
/// | Level | Effect |
/// |-------|--------|
/// | Critical | clear memory cache, clear pool |
/// | Moderate | trim pool to 5 buffers |
/// | UiHidden | trim pool to 7 buffers |
/// | Normal | none |
pub struct MemoryPressureMonitor {
    memory_cache: Arc<MemoryCache>,
    pool: Arc<BufferPool>,
    probe: Arc<dyn MemoryProbe>,
    low_memory_ratio: f64,
    stats: Mutex<PressureStats>,
}

impl MemoryPressureMonitor {
    pub fn new(
        memory_cache: Arc<MemoryCache>,
        pool: Arc<BufferPool>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            memory_cache,
            pool,
            probe,
            low_memory_ratio: DEFAULT_LOW_MEMORY_RATIO,
            stats: Mutex::new(PressureStats::default()),
        }
    }

    /// Set the available/max ratio below which memory counts as low
    pub fn with_low_memory_ratio(mut self, ratio: f64) -> Self {
        self.low_memory_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Handle a pressure signal from the host
    pub fn on_pressure(&self, level: PressureLevel) {
        {
            let mut stats = self.stats.lock().unwrap();
            if stats.current_level != level {
                tracing::info!(from = stats.current_level.name(), to = level.name(), "memory pressure changed");
            }
            stats.current_level = level;
            stats.signals += 1;
            stats.last_signal = Some(Instant::now());
            if level == PressureLevel::Critical {
                stats.critical_signals += 1;
            }
        }

        match level {
            PressureLevel::Critical => {
                self.memory_cache.clear();
                let disposed = self.pool.clear();
                tracing::info!(disposed, "cleared memory cache and buffer pool");
            }
            PressureLevel::Moderate => {
                self.pool.trim_to_size(MODERATE_POOL_SIZE);
            }
            PressureLevel::UiHidden => {
                self.pool.trim_to_size(UI_HIDDEN_POOL_SIZE);
            }
            PressureLevel::Normal => {}
        }
    }

    /// Handle a numeric host trim level
    pub fn on_trim_level(&self, level: u32) {
        self.on_pressure(PressureLevel::from_trim_level(level));
    }

    /// Handle a full low-memory signal; same effect as Critical
    pub fn on_low_memory(&self) {
        self.on_pressure(PressureLevel::Critical);
    }

    /// Whether host memory headroom is currently low
    ///
    /// Returns `false` when the probe cannot report figures.
    pub fn is_low_memory(&self) -> bool {
        match (self.probe.available_bytes(), self.probe.max_usable_bytes()) {
            (Some(available), Some(max)) if max > 0 => {
                (available as f64) < (max as f64) * self.low_memory_ratio
            }
            _ => false,
        }
    }

    pub fn current_level(&self) -> PressureLevel {
        self.stats.lock().unwrap().current_level
    }

    pub fn stats(&self) -> PressureStats {
        *self.stats.lock().unwrap()
    }
}
