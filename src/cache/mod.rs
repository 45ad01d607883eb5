//! Value cache — a byte-bounded LRU over hot decoded values.
//!
//! Sits in front of the read path, keyed by user key and holding
//! *plaintext* values (decryption already paid). Writers update it on
//! every put, deletes evict, and lookups return copies so cached bytes
//! are never aliased by callers.
//!
//! Capacity is expressed in bytes (`|key| + |value|` per entry); the LRU
//! tail is evicted until the total fits. The balanced mode sizes itself
//! to ~2% of detected system memory, clamped to [4 MiB, 32 MiB].
//! Value buffers recycle through a bounded pool to keep insert/evict
//! churn off the allocator.

#[cfg(test)]
mod tests;

use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use crate::record::BufferPool;

/// Lower clamp for adaptive sizing.
pub const MIN_ADAPTIVE_CAPACITY: usize = 4 * 1024 * 1024;

/// Upper clamp for adaptive sizing.
pub const MAX_ADAPTIVE_CAPACITY: usize = 32 * 1024 * 1024;

/// Fallback when system memory cannot be detected.
const FALLBACK_CAPACITY: usize = 8 * 1024 * 1024;

/// Cache sizing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Cache as much as the clamp allows (32 MiB).
    Aggressive,

    /// Adaptive: ~2% of system memory, clamped to [4 MiB, 32 MiB].
    Balanced,

    /// Minimal footprint (4 MiB); leaves memory to the application.
    Performance,
}

impl CacheMode {
    /// Resolves the mode to a byte capacity.
    pub fn capacity_bytes(self) -> usize {
        match self {
            CacheMode::Aggressive => MAX_ADAPTIVE_CAPACITY,
            CacheMode::Balanced => adaptive_capacity(),
            CacheMode::Performance => MIN_ADAPTIVE_CAPACITY,
        }
    }
}

/// ~2% of detected system memory, clamped to [4 MiB, 32 MiB].
pub fn adaptive_capacity() -> usize {
    let Some(total) = system_memory_bytes() else {
        return FALLBACK_CAPACITY;
    };
    (total / 50).clamp(MIN_ADAPTIVE_CAPACITY, MAX_ADAPTIVE_CAPACITY)
}

/// Total system memory from `/proc/meminfo`.
fn system_memory_bytes() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

struct CacheInner {
    map: LruCache<Vec<u8>, Vec<u8>>,
    total_bytes: usize,
}

/// Thread-safe byte-capacity LRU of decoded values.
pub struct ValueCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    pool: BufferPool,
}

impl std::fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl ValueCache {
    /// Creates a cache bounded to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: LruCache::unbounded(),
                total_bytes: 0,
            }),
            capacity,
            pool: BufferPool::new(),
        }
    }

    /// Creates a cache sized by `mode`.
    pub fn with_mode(mode: CacheMode) -> Self {
        Self::new(mode.capacity_bytes())
    }

    /// Byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a copy of the cached value, bumping its recency.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        inner.map.get(key).map(|v| v.to_vec())
    }

    /// Inserts or replaces a value, then evicts the LRU tail until the
    /// total fits the capacity.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let entry_bytes = key.len() + value.len();
        if entry_bytes > self.capacity {
            // A value that alone exceeds capacity would evict everything
            // and still not fit.
            return;
        }

        let mut staged = self.pool.acquire();
        staged.extend_from_slice(value);

        let mut inner = self.lock();
        if let Some(old) = inner.map.put(key.to_vec(), staged) {
            inner.total_bytes -= key.len() + old.len();
            self.pool.release(old);
        }
        inner.total_bytes += entry_bytes;

        while inner.total_bytes > self.capacity {
            match inner.map.pop_lru() {
                Some((k, v)) => {
                    inner.total_bytes -= k.len() + v.len();
                    self.pool.release(v);
                }
                None => break,
            }
        }
    }

    /// Removes a key (delete path).
    pub fn remove(&self, key: &[u8]) {
        let mut inner = self.lock();
        if let Some(old) = inner.map.pop(key) {
            inner.total_bytes -= key.len() + old.len();
            self.pool.release(old);
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.total_bytes = 0;
        debug!("value cache cleared");
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Total bytes currently held.
    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
