//! MemTable — the concurrent, ordered, in-memory write buffer.
//!
//! # Design invariants
//!
//! - Holds the **latest version only** for each key: upserts replace, and
//!   deletes insert tombstone records rather than removing entries.
//! - Keys are ordered byte-lexicographically; iteration yields a sorted
//!   stream ready for SSTable construction.
//! - The approximate byte size (`|key| + |value|` per live entry) is
//!   tracked in an atomic and read without locking.
//! - Readers and writers never block each other per-key: entries live in
//!   a lock-free skip map. The single-writer discipline (the engine's
//!   write lock) is what makes the replace-and-adjust-size sequence
//!   race-free.
//!
//! # Lifecycle
//!
//! Created empty → mutated by writers → sealed into a [`FrozenMemtable`]
//! when the engine rotates it out → flushed to a level-0 SSTable →
//! discarded. A frozen memtable remembers which archived WAL segments
//! back it, so the engine can clear them from the pending-replay set once
//! the flush is durable.

#[cfg(test)]
mod tests;

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use tracing::trace;

use crate::record::Record;

/// The mutable in-memory table of live records.
///
/// All mutation entry points take `&self`; the engine serializes writers
/// above this layer, while reads go straight to the skip map.
#[derive(Debug)]
pub struct Memtable {
    entries: SkipMap<Vec<u8>, Record>,
    approximate_size: AtomicUsize,
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self {
            entries: SkipMap::new(),
            approximate_size: AtomicUsize::new(0),
        }
    }

    /// Upserts a record (put or tombstone), adjusting the byte counter by
    /// the delta against any replaced entry.
    pub fn insert(&self, record: Record) {
        let new_size = record.approximate_size();
        let old_size = self
            .entries
            .get(&record.key)
            .map(|entry| entry.value().approximate_size());

        trace!(key_len = record.key.len(), deleted = record.deleted, "memtable insert");
        self.entries.insert(record.key.clone(), record);

        match old_size {
            Some(old) if old > new_size => {
                self.approximate_size.fetch_sub(old - new_size, Ordering::Relaxed);
            }
            Some(old) => {
                self.approximate_size.fetch_add(new_size - old, Ordering::Relaxed);
            }
            None => {
                self.approximate_size.fetch_add(new_size, Ordering::Relaxed);
            }
        }
    }

    /// Applies a record recovered from WAL replay.
    ///
    /// Replay order is not guaranteed to match write order (background
    /// flushes may interleave buffers), so the newer timestamp wins.
    pub fn apply_replayed(&self, record: Record) {
        if let Some(existing) = self.entries.get(&record.key)
            && existing.value().timestamp >= record.timestamp
        {
            return;
        }
        self.insert(record);
    }

    /// Returns the stored record for `key`, including tombstones and
    /// expired entries — visibility is resolved by the caller.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Approximate byte footprint of live entries.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Number of entries (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all records in key order (tombstones included).
    ///
    /// Used for SSTable flushes and key enumeration.
    pub fn snapshot(&self) -> Vec<Record> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Records whose keys fall in `[start, end)`, in key order.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<Record> {
        self.entries
            .range((Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec())))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Records whose keys start with `prefix`, in key order.
    pub fn prefix(&self, prefix: &[u8]) -> Vec<Record> {
        self.entries
            .range((Bound::Included(prefix.to_vec()), Bound::Unbounded))
            .take_while(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// FrozenMemtable
// ------------------------------------------------------------------------------------------------

/// A sealed, read-only memtable awaiting flush to a level-0 SSTable.
///
/// Retains the archived WAL segments that contain its records; they stay
/// in the pending-replay set until the SSTable install is durable.
#[derive(Debug)]
pub struct FrozenMemtable {
    /// The sealed table. Still structurally mutable, but no writer
    /// targets it after the swap.
    pub table: Arc<Memtable>,

    /// Archived WAL segments backing this table's records.
    pub wal_segments: Vec<PathBuf>,

    /// Wall-clock nanoseconds at seal time; newer frozen tables shadow
    /// older ones in the read path.
    pub sealed_at: u64,
}

impl FrozenMemtable {
    /// Seals `table`, associating the WAL segments that back it.
    pub fn new(table: Arc<Memtable>, wal_segments: Vec<PathBuf>) -> Self {
        Self {
            table,
            wal_segments,
            sealed_at: crate::clock::now_nanos(),
        }
    }

    /// Lookup, tombstones and expired entries included.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.table.get(key)
    }
}
