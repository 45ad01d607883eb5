//! Record model — the atomic unit of storage.
//!
//! A [`Record`] is the plaintext, in-memory shape of a mutation: key,
//! value, wall-clock timestamp, optional expiry, tombstone flag, and a
//! CRC32 over the plaintext computed at creation time. A [`SealedRecord`]
//! is the encrypted wire shape shared by the WAL and SSTable data blocks:
//! the value is replaced by an AEAD `(nonce, ciphertext)` pair while every
//! other field travels in the clear and is bound into the AEAD tag as
//! associated data.
//!
//! # Wire framing
//!
//! Both WAL entries and SSTable records use the same little-endian frame:
//!
//! ```text
//! u32 key_len | key | u16 nonce_len | nonce | u32 ct_len | ciphertext
//!     | u64 timestamp_ns | u64 expires_at_ns | u8 deleted | u32 crc32
//! ```
//!
//! # Checksum rules
//!
//! `crc32` covers `key || value` for puts and `key` alone for tombstones.
//! It is computed once when the record is created and re-verified after
//! decryption on WAL replay and on every SSTable read.
//!
//! # Buffer pooling
//!
//! Records are created through the engine write path at high rates, so
//! encode scratch space is recycled through a bounded [`BufferPool`]
//! instead of allocating per write.

#[cfg(test)]
mod tests;

use std::sync::Mutex;

use crc32fast::Hasher as Crc32;

use crate::clock;
use crate::encoding::{self, Decode, Encode, EncodingError};

/// Expiry value meaning "never expires".
pub const NO_EXPIRY: u64 = 0;

// ------------------------------------------------------------------------------------------------
// Record — plaintext, in-memory
// ------------------------------------------------------------------------------------------------

/// A single plaintext key-value mutation.
///
/// Ordering between records for the same key is decided by layer rank
/// first (memtable before L0 before L1…) and timestamp second; the record
/// itself only carries the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Opaque user key; never empty.
    pub key: Vec<u8>,

    /// Plaintext value. Empty for tombstones.
    pub value: Vec<u8>,

    /// Wall-clock nanoseconds at write time (strictly increasing).
    pub timestamp: u64,

    /// Expiry in nanoseconds since epoch; [`NO_EXPIRY`] disables expiry.
    pub expires_at: u64,

    /// Tombstone flag.
    pub deleted: bool,

    /// CRC32 over `key || value` (`key` alone for tombstones).
    pub crc32: u32,
}

impl Record {
    /// Creates a put record with a fresh timestamp and computed checksum.
    pub fn new_put(key: Vec<u8>, value: Vec<u8>, expires_at: u64) -> Self {
        let crc32 = checksum(&key, &value, false);
        Self {
            key,
            value,
            timestamp: clock::now_nanos(),
            expires_at,
            deleted: false,
            crc32,
        }
    }

    /// Creates a tombstone for `key` with a fresh timestamp.
    pub fn new_tombstone(key: Vec<u8>) -> Self {
        let crc32 = checksum(&key, &[], true);
        Self {
            key,
            value: Vec::new(),
            timestamp: clock::now_nanos(),
            expires_at: NO_EXPIRY,
            deleted: true,
            crc32,
        }
    }

    /// Re-computes the checksum and compares it against the stored one.
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.key, &self.value, self.deleted) == self.crc32
    }

    /// Whether this record has expired as of `now` (nanoseconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != NO_EXPIRY && self.expires_at < now
    }

    /// Approximate in-memory footprint used for memtable sizing.
    pub fn approximate_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// CRC32 over the plaintext: `key || value` for puts, `key` for tombstones.
pub fn checksum(key: &[u8], value: &[u8], deleted: bool) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(key);
    if !deleted {
        hasher.update(value);
    }
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// SealedRecord — encrypted wire form
// ------------------------------------------------------------------------------------------------

/// The encrypted on-disk shape of a [`Record`].
///
/// Produced by [`Cipher::seal`](crate::crypto::Cipher::seal); the metadata
/// fields are bound into the AEAD tag, so tampering with any of them makes
/// [`Cipher::open`](crate::crypto::Cipher::open) fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    /// Cleartext user key (keys are not secret; values are).
    pub key: Vec<u8>,

    /// Fresh random AEAD nonce (24 bytes for XChaCha20-Poly1305).
    pub nonce: Vec<u8>,

    /// AEAD output over the plaintext value.
    pub ciphertext: Vec<u8>,

    /// Copied from the plaintext record; part of the AAD.
    pub timestamp: u64,

    /// Copied from the plaintext record; part of the AAD.
    pub expires_at: u64,

    /// Copied from the plaintext record; part of the AAD.
    pub deleted: bool,

    /// Plaintext checksum, verified after decryption.
    pub crc32: u32,
}

impl SealedRecord {
    /// Size of the encoded frame in bytes.
    pub fn frame_len(&self) -> usize {
        4 + self.key.len() + 2 + self.nonce.len() + 4 + self.ciphertext.len() + 8 + 8 + 1 + 4
    }

    /// Whether this record has expired as of `now` (nanoseconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != NO_EXPIRY && self.expires_at < now
    }
}

impl Encode for SealedRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.key, buf)?;
        encoding::encode_short_bytes(&self.nonce, buf)?;
        Encode::encode_to(&self.ciphertext, buf)?;
        Encode::encode_to(&self.timestamp, buf)?;
        Encode::encode_to(&self.expires_at, buf)?;
        Encode::encode_to(&self.deleted, buf)?;
        Encode::encode_to(&self.crc32, buf)?;
        Ok(())
    }
}

impl Decode for SealedRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (nonce, n) = encoding::decode_short_bytes(&buf[offset..])?;
        offset += n;
        let (ciphertext, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (expires_at, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (deleted, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (crc32, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                key,
                nonce,
                ciphertext,
                timestamp,
                expires_at,
                deleted,
                crc32,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// BufferPool — bounded scratch-buffer recycling
// ------------------------------------------------------------------------------------------------

/// Default number of pooled buffers.
const DEFAULT_POOL_SLOTS: usize = 64;

/// Buffers larger than this are dropped instead of pooled, so one giant
/// value cannot pin memory forever.
const DEFAULT_MAX_POOLED_BYTES: usize = 64 * 1024;

/// A bounded pool of reusable byte buffers.
///
/// `acquire` hands out a cleared buffer (recycled when available);
/// `release` returns it. The pool caps both the number of retained
/// buffers and the size of each retained buffer.
#[derive(Debug)]
pub struct BufferPool {
    slots: Mutex<Vec<Vec<u8>>>,
    max_slots: usize,
    max_buf_bytes: usize,
}

impl BufferPool {
    /// Creates a pool with the default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_POOL_SLOTS, DEFAULT_MAX_POOLED_BYTES)
    }

    /// Creates a pool retaining at most `max_slots` buffers of at most
    /// `max_buf_bytes` capacity each.
    pub fn with_limits(max_slots: usize, max_buf_bytes: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_slots)),
            max_slots,
            max_buf_bytes,
        }
    }

    /// Takes a cleared buffer from the pool, or allocates a fresh one.
    pub fn acquire(&self) -> Vec<u8> {
        let mut slots = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.pop().unwrap_or_default()
    }

    /// Returns a buffer to the pool. Oversized buffers and overflow past
    /// the slot limit are simply dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_buf_bytes {
            return;
        }
        buf.clear();
        let mut slots = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slots.len() < self.max_slots {
            slots.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
