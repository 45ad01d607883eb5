//! Batched writes — buffer many mutations, commit them with one sync.
//!
//! A [`Batch`] buffers up to a configured maximum number of records;
//! timestamps are assigned at enqueue time, so the batch preserves the
//! caller's ordering. `flush` appends every record to the WAL, syncs
//! once, and only then applies the records to the memtable (and cache,
//! and the optional write listener) in insertion order.
//!
//! # Partial failure policy
//!
//! - WAL append or sync fails → no memtable changes are applied and the
//!   error is surfaced; nothing became visible.
//! - WAL succeeded but a downstream collaborator fails → the core data
//!   is durable and visible; the downstream error is returned.

use tracing::debug;

use crate::cancel::CancelToken;
use crate::clock;
use crate::record::{NO_EXPIRY, Record};

use super::{Db, DbError, validate_key};

/// A buffered batch writer tied to its database handle.
pub struct Batch<'db> {
    db: &'db Db,
    records: Vec<Record>,
    max_records: usize,
}

impl<'db> Batch<'db> {
    pub(super) fn new(db: &'db Db, max_records: usize) -> Self {
        Self {
            db,
            records: Vec::new(),
            max_records,
        }
    }

    /// Buffers a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DbError> {
        self.put_with_ttl(key, value, std::time::Duration::ZERO)
    }

    /// Buffers a put with an expiry of `now + ttl`; zero disables expiry.
    pub fn put_with_ttl(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: std::time::Duration,
    ) -> Result<(), DbError> {
        validate_key(&key)?;
        self.ensure_capacity()?;
        let expires_at = if ttl.is_zero() {
            NO_EXPIRY
        } else {
            clock::now_nanos().saturating_add(ttl.as_nanos() as u64)
        };
        self.records.push(Record::new_put(key, value, expires_at));
        Ok(())
    }

    /// Buffers a tombstone.
    pub fn delete(&mut self, key: Vec<u8>) -> Result<(), DbError> {
        validate_key(&key)?;
        self.ensure_capacity()?;
        self.records.push(Record::new_tombstone(key));
        Ok(())
    }

    /// Buffered record count.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Discards the buffered records without writing anything.
    pub fn cancel(mut self) {
        self.records.clear();
    }

    /// Commits the batch: WAL-append everything, sync once, then apply
    /// to the memtable in insertion order.
    pub fn flush(self, token: &CancelToken) -> Result<(), DbError> {
        token.check()?;
        let shared = &self.db.shared;
        shared.ensure_open()?;

        if self.records.is_empty() {
            return Ok(());
        }
        let count = self.records.len();

        // Seal upfront so a cipher failure aborts before any WAL bytes.
        let mut sealed = Vec::with_capacity(count);
        for record in &self.records {
            sealed.push(shared.cipher.seal(record)?);
        }

        // Exclusive section: the whole batch lands atomically with
        // respect to readers.
        let state = shared.write_state()?;
        for frame in &sealed {
            shared.wal.append(frame)?;
        }
        shared.wal.sync()?;

        // Durable from here on: memtable, cache, and collaborator.
        let listener = match shared.listener.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut downstream: Result<(), DbError> = Ok(());
        for record in self.records {
            if record.deleted || record.expires_at != NO_EXPIRY {
                shared.cache.remove(&record.key);
            } else {
                shared.cache.put(&record.key, &record.value);
            }
            if let Some(l) = &listener
                && downstream.is_ok()
            {
                downstream = if record.deleted {
                    l.on_delete(&record.key)
                } else {
                    l.on_put(&record.key, &record.value)
                };
            }
            state.active.insert(record);
        }
        drop(state);

        debug!(count, "batch flushed");
        shared.signal_flush();
        downstream
    }

    fn ensure_capacity(&self) -> Result<(), DbError> {
        if self.records.len() >= self.max_records {
            return Err(DbError::ResourceExhausted(format!(
                "batch holds the maximum of {} records",
                self.max_records
            )));
        }
        Ok(())
    }
}
