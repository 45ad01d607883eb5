//! Shared helpers for compaction tests.

use std::path::Path;
use std::sync::Arc;

use crate::compaction::CompactionSettings;
use crate::crypto::Cipher;
use crate::record::{NO_EXPIRY, Record};
use crate::sstable::{Segment, SegmentWriter};

pub fn test_cipher() -> Cipher {
    Cipher::new(&[42u8; 32]).unwrap()
}

pub fn test_settings() -> CompactionSettings {
    CompactionSettings {
        max_levels: 7,
        ratio: 4,
        level_base_bytes: 16 * 1024,
        l0_segment_threshold: 4,
        segment_target_bytes: 64 * 1024,
        block_size: 512,
        bloom_bits_per_key: 10,
    }
}

/// Builds a segment of put records at `level` and opens it.
pub fn segment_of_puts(
    dir: &Path,
    level: u8,
    cipher: &Cipher,
    entries: &[(&[u8], &[u8])],
) -> Arc<Segment> {
    let mut sorted: Vec<_> = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut writer = SegmentWriter::create(dir, level, sorted.len(), 512, 10).unwrap();
    for (key, value) in sorted {
        let record = Record::new_put(key.to_vec(), value.to_vec(), NO_EXPIRY);
        writer.add(&cipher.seal(&record).unwrap()).unwrap();
    }
    Arc::new(Segment::open(writer.finish().unwrap()).unwrap())
}

/// Builds a segment from arbitrary records (tombstones, TTLs).
pub fn segment_of_records(
    dir: &Path,
    level: u8,
    cipher: &Cipher,
    records: &[Record],
) -> Arc<Segment> {
    let mut sorted: Vec<_> = records.to_vec();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut writer = SegmentWriter::create(dir, level, sorted.len(), 512, 10).unwrap();
    for record in &sorted {
        writer.add(&cipher.seal(record).unwrap()).unwrap();
    }
    Arc::new(Segment::open(writer.finish().unwrap()).unwrap())
}

/// Empty level vector shaped for `max_levels`.
pub fn empty_levels(max_levels: u8) -> Vec<Vec<Arc<Segment>>> {
    vec![Vec::new(); max_levels as usize]
}
