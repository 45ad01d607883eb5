//! Sorted String Table (SSTable) — immutable, encrypted, block-structured
//! on-disk segments.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: magic u32 | version u32 | entry_count u32 | min_key | max_key]
//! [DATA BLOCK 0: sealed record frames, back to back]
//! [DATA BLOCK 1]
//! ...
//! [BLOOM: u32 len | filter bytes]
//! [INDEX: u32 count | (first_key, offset u64, len u32)…]
//! [FOOTER: bloom_offset u64 | index_offset u64 | magic u32]
//! ```
//!
//! Data blocks target a fixed size (≈4 KiB) and split on record
//! boundaries. Each record inside a block is a [`SealedRecord`] frame —
//! value encrypted, metadata in the clear and bound into the AEAD tag.
//! The bloom filter covers the full key set; the index holds one entry
//! per block.
//!
//! # Invariants
//!
//! - Keys are strictly increasing across the segment.
//! - Header `min_key` / `max_key` equal the first and last key.
//! - Bloom membership is a superset of the stored key set.
//! - CRC32 and the AEAD tag validate on every read.
//!
//! # Index residency
//!
//! Small segments (block count at or under the materialization
//! threshold) keep the full index in memory. Larger segments keep every
//! Nth entry plus its byte offset into the index block; lookups binary
//! search the sparse sample and lazily decode the covered index slice
//! from the mapped file.
//!
//! # Concurrency
//!
//! Segments are immutable, so reads are lock-free and handles can be
//! shared across threads behind `Arc`. A corruption discovered during a
//! normal read flips the `read_broken` quarantine flag; further reads
//! fail fast until a [`repair`] pass rewrites the segment.

pub mod builder;
pub mod iterator;
pub mod repair;

#[cfg(test)]
mod tests;

pub use builder::SegmentWriter;
pub use iterator::{BlockIter, SealedScan};

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{Cipher, CipherError};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::{Record, SealedRecord};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Header and footer magic: `0xDEADBEEF`.
pub const SST_MAGIC: u32 = 0xDEAD_BEEF;

/// Current format version.
pub const SST_VERSION: u32 = 1;

/// Footer byte length: two u64 offsets plus the trailing magic.
pub const SST_FOOTER_SIZE: usize = 8 + 8 + 4;

/// Block count at or below which the whole index stays resident.
pub(crate) const INDEX_MATERIALIZE_THRESHOLD: usize = 512;

/// Sparse-index sampling step for large segments.
pub(crate) const SPARSE_INDEX_STEP: usize = 16;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Decryption or checksum failure.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Structural damage: bad magic, truncated block, out-of-range
    /// offsets, or a quarantined segment.
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

/// Fixed-position header at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub(crate) magic: u32,
    pub(crate) version: u32,
    pub(crate) entry_count: u32,
    pub(crate) min_key: Vec<u8>,
    pub(crate) max_key: Vec<u8>,
}

impl Encode for SegmentHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.magic, buf)?;
        Encode::encode_to(&self.version, buf)?;
        Encode::encode_to(&self.entry_count, buf)?;
        Encode::encode_to(&self.min_key, buf)?;
        Encode::encode_to(&self.max_key, buf)?;
        Ok(())
    }
}

impl Decode for SegmentHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (entry_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                entry_count,
                min_key,
                max_key,
            },
            offset,
        ))
    }
}

/// One index entry per data block: first key, absolute file offset, and
/// block byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: Vec<u8>,
    pub(crate) offset: u64,
    pub(crate) len: u32,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.first_key, buf)?;
        Encode::encode_to(&self.offset, buf)?;
        Encode::encode_to(&self.len, buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                first_key,
                offset,
                len,
            },
            off,
        ))
    }
}

/// Fixed-size footer at the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentFooter {
    pub(crate) bloom_offset: u64,
    pub(crate) index_offset: u64,
    pub(crate) magic: u32,
}

impl Encode for SegmentFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.bloom_offset, buf)?;
        Encode::encode_to(&self.index_offset, buf)?;
        Encode::encode_to(&self.magic, buf)?;
        Ok(())
    }
}

impl Decode for SegmentFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (bloom_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (index_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (magic, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                bloom_offset,
                index_offset,
                magic,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Filename scheme
// ------------------------------------------------------------------------------------------------

/// Builds the canonical segment file name `sst_L<level>_<ns>.db`.
pub fn segment_file_name(level: u8, created_ns: u64) -> String {
    format!("sst_L{level}_{created_ns}.db")
}

/// Parses `(level, created_ns)` out of a segment file name, or `None`
/// when the name does not follow the scheme.
pub fn parse_segment_file_name(name: &str) -> Option<(u8, u64)> {
    let rest = name.strip_prefix("sst_L")?.strip_suffix(".db")?;
    let (level, ns) = rest.split_once('_')?;
    Some((level.parse().ok()?, ns.parse().ok()?))
}

// ------------------------------------------------------------------------------------------------
// Index residency
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum IndexResidency {
    /// Whole index resident.
    Full(Vec<IndexEntry>),

    /// Every Nth entry resident, each paired with its byte offset inside
    /// the on-disk index block for lazy exact lookup.
    Sparse {
        sample: Vec<(IndexEntry, usize)>,
        step: usize,
        total: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Segment — immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable SSTable segment.
pub struct Segment {
    /// Creation timestamp (nanoseconds) parsed from the file name;
    /// doubles as the segment's unique ID and its L0 tie-breaker.
    pub id: u64,

    /// Level this segment belongs to. The persisted catalog is
    /// authoritative; the engine overrides the filename-derived value
    /// when they disagree.
    pub level: u8,

    /// Segment file path.
    pub path: PathBuf,

    mmap: Mmap,
    entry_count: u32,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    bloom: Option<Bloom<[u8]>>,
    index: IndexResidency,
    index_block: (usize, usize),
    data_start: usize,
    read_broken: AtomicBool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("path", &self.path)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Opens and validates a segment: header, footer, bloom filter, and
    /// the resident portion of the index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        // Safety: the file is immutable once written (tmp + rename) and
        // the map is read-only; all offsets are bounds-checked below.
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < SST_FOOTER_SIZE {
            return Err(SstError::Corrupt("file shorter than footer".into()));
        }

        let footer_start = file_len - SST_FOOTER_SIZE;
        let (footer, _) = encoding::decode_from_slice::<SegmentFooter>(&mmap[footer_start..])?;
        if footer.magic != SST_MAGIC {
            return Err(SstError::Corrupt("bad footer magic".into()));
        }

        let (header, header_len) = encoding::decode_from_slice::<SegmentHeader>(&mmap)?;
        if header.magic != SST_MAGIC {
            return Err(SstError::Corrupt("bad header magic".into()));
        }
        if header.version != SST_VERSION {
            return Err(SstError::Corrupt(format!(
                "unsupported version {}",
                header.version
            )));
        }

        let bloom_start = usize::try_from(footer.bloom_offset)
            .map_err(|_| SstError::Corrupt("bloom offset out of range".into()))?;
        let index_start = usize::try_from(footer.index_offset)
            .map_err(|_| SstError::Corrupt("index offset out of range".into()))?;
        if bloom_start < header_len || index_start <= bloom_start || index_start > footer_start {
            return Err(SstError::Corrupt("inconsistent section offsets".into()));
        }

        let (bloom_bytes, _) = <Vec<u8>>::decode_from(&mmap[bloom_start..index_start])?;
        let bloom = if bloom_bytes.is_empty() {
            None
        } else {
            match Bloom::from_slice(&bloom_bytes) {
                Ok(b) => Some(b),
                Err(_) => {
                    // A damaged filter only loses the negative fast path.
                    warn!(path = %path.display(), "unreadable bloom filter; disabling");
                    None
                }
            }
        };

        let index_block = (index_start, footer_start - index_start);
        let index = Self::load_index(&mmap, index_start, footer_start)?;

        let (level, id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name)
            .unwrap_or((0, 0));

        debug!(
            path = %path.display(),
            entries = header.entry_count,
            level,
            "segment opened"
        );

        Ok(Self {
            id,
            level,
            path,
            mmap,
            entry_count: header.entry_count,
            min_key: header.min_key,
            max_key: header.max_key,
            bloom,
            index,
            index_block,
            data_start: header_len,
            read_broken: AtomicBool::new(false),
        })
    }

    /// Decodes the index block, keeping it fully resident for small
    /// segments and a sparse sample for large ones.
    fn load_index(
        mmap: &Mmap,
        index_start: usize,
        index_end: usize,
    ) -> Result<IndexResidency, SstError> {
        let block = &mmap[index_start..index_end];
        let (count, mut cursor) = u32::decode_from(block)?;
        let count = count as usize;

        if count <= INDEX_MATERIALIZE_THRESHOLD {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let (entry, n) = IndexEntry::decode_from(&block[cursor..])?;
                cursor += n;
                entries.push(entry);
            }
            return Ok(IndexResidency::Full(entries));
        }

        let mut sample = Vec::with_capacity(count / SPARSE_INDEX_STEP + 1);
        for i in 0..count {
            let entry_off = cursor;
            let (entry, n) = IndexEntry::decode_from(&block[cursor..])?;
            cursor += n;
            if i % SPARSE_INDEX_STEP == 0 {
                sample.push((entry, entry_off));
            }
        }
        Ok(IndexResidency::Sparse {
            sample,
            step: SPARSE_INDEX_STEP,
            total: count,
        })
    }

    /// Number of records stored in this segment.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Smallest stored key.
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest stored key.
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Segment file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Whether `[min_key, max_key]` intersects the other segment's range.
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.min_key <= other.max_key && other.min_key <= self.max_key
    }

    /// Whether the key range `[start, end]` intersects this segment.
    pub fn overlaps_range(&self, start: &[u8], end: &[u8]) -> bool {
        self.min_key.as_slice() <= end && start <= self.max_key.as_slice()
    }

    /// Bloom check: `false` means definitively absent, `true` means the
    /// data blocks must be consulted.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.check(key),
            None => true,
        }
    }

    /// Quarantine state after a corruption error.
    pub fn is_read_broken(&self) -> bool {
        self.read_broken.load(Ordering::SeqCst)
    }

    /// Marks the segment broken so subsequent reads fail fast until a
    /// repair pass runs.
    pub fn quarantine(&self) {
        self.read_broken.store(true, Ordering::SeqCst);
    }

    /// Point lookup.
    ///
    /// Returns the stored record (tombstones and expired entries
    /// included) or `None`. Structural corruption quarantines the
    /// segment and surfaces as [`SstError::Corrupt`]; an authentication
    /// failure surfaces as [`SstError::Cipher`].
    pub fn get(&self, key: &[u8], cipher: &Cipher) -> Result<Option<Record>, SstError> {
        match self.get_sealed(key)? {
            Some(sealed) => {
                let record = cipher.open(&sealed).map_err(|e| {
                    if matches!(e, CipherError::ChecksumMismatch) {
                        self.quarantine();
                    }
                    SstError::from(e)
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Point lookup without decryption: the sealed record's cleartext
    /// metadata is enough for merges, visibility checks, and `has`.
    pub fn get_sealed(&self, key: &[u8]) -> Result<Option<SealedRecord>, SstError> {
        if self.is_read_broken() {
            return Err(SstError::Corrupt("segment quarantined".into()));
        }
        if !self.may_contain(key) {
            return Ok(None);
        }
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(None);
        }

        let Some(entry) = self.find_block(key)? else {
            return Ok(None);
        };

        let block = self.block_bytes(&entry)?;
        for result in BlockIter::new(block) {
            let sealed = result.map_err(|e| {
                self.quarantine();
                SstError::Corrupt(format!("block decode failed: {e}"))
            })?;
            match sealed.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(sealed)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Range scan over sealed records in `[start, end)`, block by block.
    pub fn scan_sealed(&self, start: &[u8], end: &[u8]) -> Result<SealedScan<'_>, SstError> {
        if self.is_read_broken() {
            return Err(SstError::Corrupt("segment quarantined".into()));
        }
        SealedScan::new(self, start.to_vec(), Some(end.to_vec()))
    }

    /// Full-segment scan over sealed records in key order.
    pub fn iter_sealed(&self) -> Result<SealedScan<'_>, SstError> {
        if self.is_read_broken() {
            return Err(SstError::Corrupt("segment quarantined".into()));
        }
        SealedScan::new(self, self.min_key.clone(), None)
    }

    // --------------------------------------------------------------------
    // Block access
    // --------------------------------------------------------------------

    /// Index position of the block that may contain `key` (the last
    /// block whose first key is ≤ `key`).
    fn find_block(&self, key: &[u8]) -> Result<Option<IndexEntry>, SstError> {
        match &self.index {
            IndexResidency::Full(entries) => Ok(find_candidate(entries, key).cloned()),

            IndexResidency::Sparse { sample, step, total } => {
                let (step, total) = (*step, *total);
                // Locate the sampled window, then decode just that slice
                // of the index block.
                let window = match sample
                    .binary_search_by(|(entry, _)| entry.first_key.as_slice().cmp(key))
                {
                    Ok(i) => i,
                    Err(0) => return Ok(None),
                    Err(i) => i - 1,
                };

                let mut cursor = sample[window].1;
                let block = &self.mmap[self.index_block.0..self.index_block.0 + self.index_block.1];
                let remaining = total - window * step;
                let mut candidate: Option<IndexEntry> = None;
                for _ in 0..step.min(remaining) {
                    let (entry, n) = IndexEntry::decode_from(&block[cursor..])
                        .map_err(|e| SstError::Corrupt(format!("index decode failed: {e}")))?;
                    cursor += n;
                    if entry.first_key.as_slice() <= key {
                        candidate = Some(entry);
                    } else {
                        break;
                    }
                }
                Ok(candidate)
            }
        }
    }

    /// All resident-or-decoded index entries, in order. Sparse segments
    /// decode the full block lazily.
    pub(crate) fn index_entries(&self) -> Result<Vec<IndexEntry>, SstError> {
        match &self.index {
            IndexResidency::Full(entries) => Ok(entries.clone()),
            IndexResidency::Sparse { total, .. } => {
                let block = &self.mmap[self.index_block.0..self.index_block.0 + self.index_block.1];
                let (_, mut cursor) = u32::decode_from(block)?;
                let mut entries = Vec::with_capacity(*total);
                for _ in 0..*total {
                    let (entry, n) = IndexEntry::decode_from(&block[cursor..])
                        .map_err(|e| SstError::Corrupt(format!("index decode failed: {e}")))?;
                    cursor += n;
                    entries.push(entry);
                }
                Ok(entries)
            }
        }
    }

    /// Raw bytes of one data block, bounds-checked against the map.
    pub(crate) fn block_bytes(&self, entry: &IndexEntry) -> Result<&[u8], SstError> {
        let start = usize::try_from(entry.offset)
            .map_err(|_| SstError::Corrupt("block offset out of range".into()))?;
        let len = entry.len as usize;
        if start < self.data_start || start + len > self.mmap.len() {
            self.quarantine();
            return Err(SstError::Corrupt("block out of range".into()));
        }
        Ok(&self.mmap[start..start + len])
    }
}

/// Binary search for the last entry whose first key is ≤ `key`.
fn find_candidate<'a>(entries: &'a [IndexEntry], key: &[u8]) -> Option<&'a IndexEntry> {
    match entries.binary_search_by(|entry| entry.first_key.as_slice().cmp(key)) {
        Ok(i) => Some(&entries[i]),
        Err(0) => None,
        Err(i) => Some(&entries[i - 1]),
    }
}
