//! In-memory image cache with LRU eviction
//!
//! Provides size-bounded caching of decoded buffers, measured in kilobytes of
//! pixel data. When an insert would exceed the capacity, least recently used
//! entries are evicted until the new entry fits. Every removal is reported as
//! an [`Eviction`] to the listener supplied at construction, which is how the
//! [`BufferPool`](crate::BufferPool) gets memory back for reuse.

use crate::buffer::PooledBuffer;
use crate::key::CacheKey;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// Evicted to make room for a new entry
    Capacity,
    /// Overwritten by a `put` with the same key
    Replaced,
    /// Removed explicitly by key
    Removed,
    /// Removed by `clear`
    Cleared,
    /// Removed by `trim_to_size` or a capacity reduction
    Trimmed,
}

/// An entry that left the cache
#[derive(Debug)]
pub struct Eviction {
    pub key: CacheKey,
    pub buffer: Arc<PooledBuffer>,
    pub cause: EvictionCause,
}

/// Callback receiving every eviction, invoked outside the cache lock
pub type EvictionListener = Arc<dyn Fn(Eviction) + Send + Sync>;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    /// Maximum size in kilobytes
    pub capacity_kb: usize,

    /// Current aggregate size in kilobytes
    pub size_kb: usize,

    /// Number of cached entries
    pub entry_count: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries evicted for capacity or trimming
    pub evictions: u64,
}

impl MemoryCacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity_kb == 0 {
            0.0
        } else {
            self.size_kb as f64 / self.capacity_kb as f64
        }
    }
}

struct Entry {
    buffer: Arc<PooledBuffer>,
    size_kb: usize,
    /// Position in the access order; larger is more recent
    tick: u64,
}

/// Internal cache state
struct CacheState {
    entries: HashMap<CacheKey, Entry>,

    /// Access order, least recently used first
    order: BTreeMap<u64, CacheKey>,

    /// Monotonic access counter; also breaks ties by insertion order
    next_tick: u64,

    size_kb: usize,
    capacity_kb: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn new(capacity_kb: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            size_kb: 0,
            capacity_kb,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Mark an entry as most recently used
    fn touch(&mut self, key: &CacheKey) {
        let tick = self.bump_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn remove_entry(&mut self, key: &CacheKey, cause: EvictionCause) -> Option<Eviction> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.size_kb = self.size_kb.saturating_sub(entry.size_kb);
        if matches!(cause, EvictionCause::Capacity | EvictionCause::Trimmed) {
            self.evictions += 1;
        }
        Some(Eviction {
            key: key.clone(),
            buffer: entry.buffer,
            cause,
        })
    }

    /// Evict the least recently used entry
    fn evict_lru(&mut self, cause: EvictionCause) -> Option<Eviction> {
        let key = self.order.values().next()?.clone();
        self.remove_entry(&key, cause)
    }

    /// Evict entries until `size_kb + required` fits within `limit`
    fn evict_to_fit(
        &mut self,
        limit: usize,
        required: usize,
        cause: EvictionCause,
        evicted: &mut Vec<Eviction>,
    ) {
        while self.size_kb + required > limit {
            match self.evict_lru(cause) {
                Some(eviction) => evicted.push(eviction),
                None => break,
            }
        }
    }
}

/// Size-bounded LRU cache from [`CacheKey`] to decoded buffer
///
/// Thread-safe; all bookkeeping happens under one lock so counters and the
/// capacity invariant hold under concurrent access.
///
/// # Example
///
/// ```
/// use image_loader_cache::{CacheKey, MemoryCache, PixelFormat, PooledBuffer};
/// use std::sync::Arc;
///
/// // 1 MB of pixel data
/// let cache = MemoryCache::new(1024);
///
/// let key = CacheKey::new("https://example.com/cat.png");
/// let buffer = Arc::new(PooledBuffer::new(256, 256, PixelFormat::Rgba8888));
/// cache.put(key.clone(), buffer);
///
/// assert!(cache.get(&key).is_some());
/// assert_eq!(cache.stats().size_kb, 256);
/// ```
pub struct MemoryCache {
    state: Mutex<CacheState>,
    listener: Option<EvictionListener>,
}

impl MemoryCache {
    /// Create a cache holding at most `capacity_kb` kilobytes of pixel data
    ///
    /// Evicted buffers are simply dropped.
    pub fn new(capacity_kb: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(capacity_kb)),
            listener: None,
        }
    }

    /// Create a cache that reports every eviction to `listener`
    pub fn with_eviction_listener(capacity_kb: usize, listener: EvictionListener) -> Self {
        Self {
            state: Mutex::new(CacheState::new(capacity_kb)),
            listener: Some(listener),
        }
    }

    fn notify(&self, evicted: Vec<Eviction>) {
        if let Some(listener) = &self.listener {
            for eviction in evicted {
                listener(eviction);
            }
        }
    }

    /// Look up a buffer, recording a hit or a miss
    ///
    /// A hit promotes the entry to most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<PooledBuffer>> {
        let mut state = self.state.lock().unwrap();

        let buffer = state.entries.get(key).map(|entry| Arc::clone(&entry.buffer));
        match buffer {
            Some(buffer) => {
                state.touch(key);
                state.hits += 1;
                Some(buffer)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an entry
    ///
    /// Least recently used entries are evicted until the new entry fits. An
    /// entry larger than the whole capacity is not stored; returns whether the
    /// buffer was cached.
    pub fn put(&self, key: CacheKey, buffer: Arc<PooledBuffer>) -> bool {
        let size_kb = buffer.size_kb();
        let mut evicted = Vec::new();

        {
            let mut state = self.state.lock().unwrap();

            if size_kb > state.capacity_kb {
                tracing::debug!(%key, size_kb, capacity_kb = state.capacity_kb, "entry larger than memory cache");
                return false;
            }

            if let Some(old) = state.remove_entry(&key, EvictionCause::Replaced) {
                if !Arc::ptr_eq(&old.buffer, &buffer) {
                    evicted.push(old);
                }
            }

            let limit = state.capacity_kb;
            state.evict_to_fit(limit, size_kb, EvictionCause::Capacity, &mut evicted);

            let tick = state.bump_tick();
            state.order.insert(tick, key.clone());
            state.entries.insert(
                key,
                Entry {
                    buffer,
                    size_kb,
                    tick,
                },
            );
            state.size_kb += size_kb;
        }

        self.notify(evicted);
        true
    }

    /// Check if a key is cached without updating LRU order or counters
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    /// Remove an entry and return its buffer
    ///
    /// The listener still sees the removal; because the caller receives a
    /// reference, the buffer is not eligible for pool return. Use
    /// [`discard`](Self::discard) to let the pool reclaim it.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<PooledBuffer>> {
        let eviction = self
            .state
            .lock()
            .unwrap()
            .remove_entry(key, EvictionCause::Removed)?;

        let buffer = Arc::clone(&eviction.buffer);
        self.notify(vec![eviction]);
        Some(buffer)
    }

    /// Remove an entry, handing its buffer only to the eviction listener
    pub fn discard(&self, key: &CacheKey) -> bool {
        let eviction = self
            .state
            .lock()
            .unwrap()
            .remove_entry(key, EvictionCause::Removed);

        match eviction {
            Some(eviction) => {
                self.notify(vec![eviction]);
                true
            }
            None => false,
        }
    }

    /// Evict every entry, least recently used first
    pub fn clear(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            while let Some(eviction) = state.evict_lru(EvictionCause::Cleared) {
                evicted.push(eviction);
            }
        }
        self.notify(evicted);
    }

    /// Evict least recently used entries until at most `size_kb` remain
    pub fn trim_to_size(&self, size_kb: usize) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.evict_to_fit(size_kb, 0, EvictionCause::Trimmed, &mut evicted);
        }
        self.notify(evicted);
    }

    /// Update the capacity, evicting entries if usage now exceeds it
    pub fn set_capacity(&self, capacity_kb: usize) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.capacity_kb = capacity_kb;
            state.evict_to_fit(capacity_kb, 0, EvictionCause::Trimmed, &mut evicted);
        }
        self.notify(evicted);
    }

    /// Get current cache statistics
    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state.lock().unwrap();
        MemoryCacheStats {
            capacity_kb: state.capacity_kb,
            size_kb: state.size_kb,
            entry_count: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    pub fn capacity_kb(&self) -> usize {
        self.state.lock().unwrap().capacity_kb
    }

    pub fn size_kb(&self) -> usize {
        self.state.lock().unwrap().size_kb
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
