//! SSTable writer — streams a sorted sequence of sealed records into a
//! complete segment file.
//!
//! # Input requirements
//!
//! Records must arrive in strictly increasing key order; a duplicate or
//! out-of-order key aborts the build. Callers (memtable flush,
//! compaction) produce deduplicated, sorted streams by construction.
//!
//! # Assembly
//!
//! The header carries `entry_count`, `min_key`, and `max_key`, which are
//! only known once the stream ends, so data blocks are first streamed
//! into a spill file. `finish()` assembles
//! `header | data | bloom | index | footer` into `<name>.tmp`, fsyncs,
//! and atomically renames it to the final `sst_L<level>_<ns>.db` name.
//! A crash can only leave `.tmp`/`.spill` files behind — startup deletes
//! those — so a segment that exists under its final name is complete by
//! construction.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use tracing::{debug, info};

use crate::clock;
use crate::encoding::{self, Encode};
use crate::record::SealedRecord;

use super::{
    IndexEntry, SST_MAGIC, SST_VERSION, SegmentFooter, SegmentHeader, SstError, segment_file_name,
};

/// Converts a bits-per-key budget into the bloom filter's target false
/// positive rate (`0.6185^(bits/key)`, the optimal-hash approximation).
fn bloom_fp_rate(bits_per_key: u32) -> f64 {
    0.6185_f64.powi(bits_per_key as i32).clamp(0.000_1, 0.5)
}

/// Streaming segment builder.
///
/// ```rust,ignore
/// let mut writer = SegmentWriter::create(dir, level, count, 4096, 10)?;
/// for sealed in sorted_records {
///     writer.add(&sealed)?;
/// }
/// let path = writer.finish()?;
/// ```
pub struct SegmentWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    spill_path: PathBuf,
    spill: BufWriter<File>,
    block_size: usize,

    current_block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    written: u64,

    index: Vec<IndexEntry>,
    bloom: Bloom<[u8]>,

    entry_count: u32,
    min_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl SegmentWriter {
    /// Opens a builder for a new level-`level` segment in `dir`.
    ///
    /// `expected_entries` sizes the bloom filter; passing the exact
    /// record count keeps the false-positive rate on target.
    pub fn create(
        dir: impl AsRef<Path>,
        level: u8,
        expected_entries: usize,
        block_size: usize,
        bloom_bits_per_key: u32,
    ) -> Result<Self, SstError> {
        let name = segment_file_name(level, clock::now_nanos());
        let final_path = dir.as_ref().join(&name);
        let tmp_path = final_path.with_extension("tmp");
        let spill_path = final_path.with_extension("spill");

        let spill_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&spill_path)?;

        let bloom = Bloom::new_for_fp_rate(
            expected_entries.max(1),
            bloom_fp_rate(bloom_bits_per_key),
        )
        .map_err(|e| SstError::Internal(format!("bloom allocation failed: {e}")))?;

        debug!(path = %final_path.display(), expected_entries, "segment build started");

        Ok(Self {
            final_path,
            tmp_path,
            spill_path,
            spill: BufWriter::new(spill_file),
            block_size,
            current_block: Vec::with_capacity(block_size),
            block_first_key: None,
            written: 0,
            index: Vec::new(),
            bloom,
            entry_count: 0,
            min_key: None,
            last_key: None,
        })
    }

    /// Appends one sealed record. Keys must strictly increase.
    pub fn add(&mut self, sealed: &SealedRecord) -> Result<(), SstError> {
        if let Some(last) = &self.last_key
            && sealed.key.as_slice() <= last.as_slice()
        {
            return Err(SstError::Internal(
                "records out of order during segment build".into(),
            ));
        }

        if self.min_key.is_none() {
            self.min_key = Some(sealed.key.clone());
        }
        if self.block_first_key.is_none() {
            self.block_first_key = Some(sealed.key.clone());
        }

        self.bloom.set(&sealed.key);
        sealed.encode_to(&mut self.current_block)?;
        self.entry_count += 1;
        self.last_key = Some(sealed.key.clone());

        if self.current_block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes of data emitted so far (flushed blocks plus the open one).
    /// Compaction uses this to split output segments at the target size.
    pub fn data_len(&self) -> u64 {
        self.written + self.current_block.len() as u64
    }

    /// Records appended so far.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    fn flush_block(&mut self) -> Result<(), SstError> {
        let first_key = match self.block_first_key.take() {
            Some(k) => k,
            None => return Ok(()),
        };

        // Offsets are relative to the data region here; finish() rebases
        // them once the header length is known.
        self.index.push(IndexEntry {
            first_key,
            offset: self.written,
            len: self.current_block.len() as u32,
        });
        self.spill.write_all(&self.current_block)?;
        self.written += self.current_block.len() as u64;
        self.current_block.clear();
        Ok(())
    }

    /// Assembles the final file, fsyncs, and renames it into place.
    /// Returns the final path.
    pub fn finish(mut self) -> Result<PathBuf, SstError> {
        if self.entry_count == 0 {
            // An empty segment has no key range; callers skip the build.
            drop(self.spill);
            let _ = fs::remove_file(&self.spill_path);
            return Err(SstError::Internal("cannot build an empty segment".into()));
        }

        self.flush_block()?;
        self.spill.flush()?;
        let spill_file = self
            .spill
            .into_inner()
            .map_err(|e| SstError::Internal(format!("spill flush failed: {e}")))?;
        drop(spill_file);

        let header = SegmentHeader {
            magic: SST_MAGIC,
            version: SST_VERSION,
            entry_count: self.entry_count,
            min_key: self.min_key.clone().unwrap_or_default(),
            max_key: self.last_key.clone().unwrap_or_default(),
        };
        let header_bytes = encoding::encode_to_vec(&header)?;

        // Rebase block offsets now that the header length is known.
        let data_start = header_bytes.len() as u64;
        for entry in &mut self.index {
            entry.offset += data_start;
        }

        let bloom_offset = data_start + self.written;
        let mut bloom_block = Vec::new();
        let bloom_bytes = self.bloom.as_slice().to_vec();
        Encode::encode_to(&bloom_bytes, &mut bloom_block)?;

        let index_offset = bloom_offset + bloom_block.len() as u64;
        let mut index_block = Vec::new();
        encoding::encode_vec(&self.index, &mut index_block)?;

        let footer = SegmentFooter {
            bloom_offset,
            index_offset,
            magic: SST_MAGIC,
        };
        let footer_bytes = encoding::encode_to_vec(&footer)?;

        // Splice header + data + tail sections into the tmp file.
        let tmp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        let mut out = BufWriter::new(tmp_file);
        out.write_all(&header_bytes)?;
        let mut spill_reader = File::open(&self.spill_path)?;
        io::copy(&mut spill_reader, &mut out)?;
        out.write_all(&bloom_block)?;
        out.write_all(&index_block)?;
        out.write_all(&footer_bytes)?;
        out.flush()?;
        let tmp_file = out
            .into_inner()
            .map_err(|e| SstError::Internal(format!("segment flush failed: {e}")))?;
        tmp_file.sync_all()?;
        drop(tmp_file);
        let _ = fs::remove_file(&self.spill_path);

        fs::rename(&self.tmp_path, &self.final_path)?;

        info!(
            path = %self.final_path.display(),
            entries = self.entry_count,
            blocks = self.index.len(),
            "segment built"
        );
        Ok(self.final_path)
    }

    /// Abandons the build and removes the scratch files.
    pub fn abort(self) {
        drop(self.spill);
        let _ = fs::remove_file(&self.spill_path);
        let _ = fs::remove_file(&self.tmp_path);
    }
}
