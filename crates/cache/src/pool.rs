//! Bounded pool of reusable pixel buffers
//!
//! Decoders ask the pool for a buffer with the exact dimensions and format of
//! the image they are about to produce. Buffers evicted from the memory cache
//! flow back here instead of being freed, so steady-state decoding performs
//! few fresh allocations.

use crate::buffer::{PixelFormat, PooledBuffer};
use crate::memory::{Eviction, EvictionListener};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default maximum number of pooled buffers
pub const DEFAULT_POOL_CAPACITY: usize = 10;

/// Snapshot of pool occupancy and counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of buffers currently held
    pub size: usize,

    /// Maximum number of buffers held
    pub capacity: usize,

    /// Total bytes of pixel storage held
    pub byte_size: usize,

    /// `acquire` calls that returned a buffer
    pub hits: u64,

    /// `acquire` calls that found no exact match
    pub misses: u64,

    /// `release` calls rejected because the buffer was immutable or recycled
    pub rejected: u64,

    /// Buffers disposed by capacity eviction, trimming or clearing
    pub disposed: u64,
}

impl PoolStats {
    /// Fraction of `acquire` calls served from the pool (0.0 to 1.0)
    pub fn reuse_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct PoolState {
    /// Oldest-inserted at the front, newest at the back
    buffers: VecDeque<PooledBuffer>,
    capacity: usize,
    byte_size: usize,
    hits: u64,
    misses: u64,
    rejected: u64,
    disposed: u64,
}

impl PoolState {
    fn dispose_oldest(&mut self) -> bool {
        match self.buffers.pop_front() {
            Some(mut buffer) => {
                self.byte_size = self.byte_size.saturating_sub(buffer.byte_count());
                buffer.recycle();
                self.disposed += 1;
                true
            }
            None => false,
        }
    }
}

/// Thread-safe pool of reusable [`PooledBuffer`]s
///
/// Matching is exact on width, height and pixel format; the pool never
/// substitutes a larger or differently shaped buffer.
///
/// # Example
///
/// ```
/// use image_loader_cache::{BufferPool, PixelFormat, PooledBuffer};
///
/// let pool = BufferPool::new(4);
/// assert!(pool.release(PooledBuffer::new(64, 64, PixelFormat::Rgba8888)));
///
/// let reused = pool.acquire(64, 64, PixelFormat::Rgba8888);
/// assert!(reused.is_some());
/// assert!(pool.acquire(32, 32, PixelFormat::Rgba8888).is_none());
/// ```
pub struct BufferPool {
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create an empty pool holding at most `capacity` buffers
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                buffers: VecDeque::with_capacity(capacity),
                capacity,
                byte_size: 0,
                hits: 0,
                misses: 0,
                rejected: 0,
                disposed: 0,
            }),
        }
    }

    /// Take a buffer matching `width` x `height` in `format` exactly
    ///
    /// The returned buffer is cleared to zero so no stale pixels leak into the
    /// next decode. Returns `None` when no exact match is pooled.
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> Option<PooledBuffer> {
        let mut state = self.state.lock().unwrap();

        let position = state
            .buffers
            .iter()
            .rposition(|buffer| buffer.matches(width, height, format));

        match position.and_then(|index| state.buffers.remove(index)) {
            Some(mut buffer) => {
                state.byte_size = state.byte_size.saturating_sub(buffer.byte_count());
                state.hits += 1;
                drop(state);

                buffer.clear();
                tracing::trace!(width, height, format = format.name(), "pool hit");
                Some(buffer)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Offer a buffer for reuse
    ///
    /// Immutable or recycled buffers are rejected. When the pool is full the
    /// single oldest buffer is disposed to make room. Returns whether the
    /// buffer was accepted.
    pub fn release(&self, buffer: PooledBuffer) -> bool {
        let mut state = self.state.lock().unwrap();

        if !buffer.is_reusable() {
            state.rejected += 1;
            return false;
        }
        if state.capacity == 0 {
            state.rejected += 1;
            return false;
        }

        while state.buffers.len() >= state.capacity {
            if !state.dispose_oldest() {
                break;
            }
        }

        state.byte_size += buffer.byte_count();
        state.buffers.push_back(buffer);
        true
    }

    /// Dispose every pooled buffer; returns how many were disposed
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        while state.dispose_oldest() {
            count += 1;
        }
        count
    }

    /// Dispose the oldest buffers until at most `size` remain
    pub fn trim_to_size(&self, size: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        while state.buffers.len() > size && state.dispose_oldest() {
            count += 1;
        }
        count
    }

    /// Current occupancy, capacity and counters
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            size: state.buffers.len(),
            capacity: state.capacity,
            byte_size: state.byte_size,
            hits: state.hits,
            misses: state.misses,
            rejected: state.rejected,
            disposed: state.disposed,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    /// Eviction listener that returns evicted memory-cache buffers to this pool
    ///
    /// A buffer is returned only when the cache held the last reference to it;
    /// a buffer still shared with a render target stays where it is and is
    /// freed normally once the last holder drops it.
    pub fn recycler(self: &Arc<Self>) -> EvictionListener {
        let pool = Arc::clone(self);
        Arc::new(move |eviction: Eviction| {
            let Eviction { key, buffer, cause } = eviction;
            match Arc::try_unwrap(buffer) {
                Ok(buffer) if buffer.is_reusable() => {
                    let accepted = pool.release(buffer);
                    tracing::trace!(%key, ?cause, accepted, "evicted buffer offered to pool");
                }
                Ok(_) => {}
                Err(_) => tracing::trace!(%key, ?cause, "evicted buffer still in use"),
            }
        })
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
