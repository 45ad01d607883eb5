//! Shared helpers for SSTable tests.

use std::path::{Path, PathBuf};

use crate::crypto::Cipher;
use crate::record::{NO_EXPIRY, Record};
use crate::sstable::{Segment, SegmentWriter};

pub const TEST_BLOCK_SIZE: usize = 4096;
pub const TEST_BLOOM_BITS: u32 = 10;

/// Deterministic test cipher.
pub fn test_cipher() -> Cipher {
    Cipher::new(&[42u8; 32]).unwrap()
}

/// Builds a level-`level` segment holding the given puts, sorted by key.
pub fn build_segment(
    dir: &Path,
    level: u8,
    cipher: &Cipher,
    entries: &[(&[u8], &[u8])],
) -> PathBuf {
    build_segment_with_block_size(dir, level, cipher, entries, TEST_BLOCK_SIZE)
}

/// Same, with an explicit block size (small sizes force many blocks).
pub fn build_segment_with_block_size(
    dir: &Path,
    level: u8,
    cipher: &Cipher,
    entries: &[(&[u8], &[u8])],
    block_size: usize,
) -> PathBuf {
    let mut sorted: Vec<_> = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut writer =
        SegmentWriter::create(dir, level, sorted.len(), block_size, TEST_BLOOM_BITS).unwrap();
    for (key, value) in sorted {
        let record = Record::new_put(key.to_vec(), value.to_vec(), NO_EXPIRY);
        writer.add(&cipher.seal(&record).unwrap()).unwrap();
    }
    writer.finish().unwrap()
}

/// Builds a segment from pre-constructed records (tombstones, TTLs).
pub fn build_segment_from_records(
    dir: &Path,
    level: u8,
    cipher: &Cipher,
    records: &[Record],
) -> PathBuf {
    let mut sorted: Vec<_> = records.to_vec();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut writer =
        SegmentWriter::create(dir, level, sorted.len(), TEST_BLOCK_SIZE, TEST_BLOOM_BITS).unwrap();
    for record in &sorted {
        writer.add(&cipher.seal(record).unwrap()).unwrap();
    }
    writer.finish().unwrap()
}

/// Builds and immediately opens a segment of puts.
pub fn open_segment(dir: &Path, cipher: &Cipher, entries: &[(&[u8], &[u8])]) -> Segment {
    let path = build_segment(dir, 0, cipher, entries);
    Segment::open(path).unwrap()
}
