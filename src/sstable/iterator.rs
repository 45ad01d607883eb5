//! SSTable iterators — single-block decoding and multi-block range scans.
//!
//! [`BlockIter`] walks the sealed record frames inside one data block.
//! [`SealedScan`] chains blocks to produce an ordered stream of sealed
//! records over a key range. Neither decrypts: the cleartext frame
//! metadata (key, timestamp, expiry, tombstone flag) is all that merges,
//! key enumeration, and visibility checks need. Callers that want the
//! value run [`Cipher::open`](crate::crypto::Cipher::open) on the
//! records they keep.

use crate::encoding::{self, EncodingError};
use crate::record::SealedRecord;

use super::{IndexEntry, Segment, SstError};

// ------------------------------------------------------------------------------------------------
// BlockIter
// ------------------------------------------------------------------------------------------------

/// Iterator over the sealed record frames of a single data block.
///
/// A block is a plain concatenation of frames, so iteration is a linear
/// decode. The first malformed frame yields one error and exhausts the
/// iterator.
pub struct BlockIter<'a> {
    data: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> BlockIter<'a> {
    /// Creates an iterator over raw block bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            failed: false,
        }
    }
}

impl Iterator for BlockIter<'_> {
    type Item = Result<SealedRecord, EncodingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.data.len() {
            return None;
        }
        match encoding::decode_from_slice::<SealedRecord>(&self.data[self.cursor..]) {
            Ok((sealed, consumed)) => {
                self.cursor += consumed;
                Some(Ok(sealed))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SealedScan
// ------------------------------------------------------------------------------------------------

/// Ordered scan over a segment's sealed records in `[start, end)`.
///
/// `end = None` scans to the end of the segment. Blocks are decoded
/// lazily and sequentially; the scan starts at the first block whose
/// first key is ≤ `start` and stops once a key reaches the upper bound.
pub struct SealedScan<'a> {
    segment: &'a Segment,
    entries: Vec<IndexEntry>,
    next_block: usize,
    block_iter: Option<BlockIter<'a>>,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    skipping: bool,
    failed: bool,
}

impl<'a> SealedScan<'a> {
    pub(crate) fn new(
        segment: &'a Segment,
        start: Vec<u8>,
        end: Option<Vec<u8>>,
    ) -> Result<Self, SstError> {
        let entries = segment.index_entries()?;

        // First block that can contain `start`: the last block whose
        // first key is ≤ start, or the very first block otherwise.
        let first = match entries.binary_search_by(|e| e.first_key.as_slice().cmp(&start)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };

        Ok(Self {
            segment,
            entries,
            next_block: first,
            block_iter: None,
            start,
            end,
            skipping: true,
            failed: false,
        })
    }

    fn load_next_block(&mut self) -> Result<bool, SstError> {
        if self.next_block >= self.entries.len() {
            self.block_iter = None;
            return Ok(false);
        }
        let entry = self.entries[self.next_block].clone();
        self.next_block += 1;

        // Skip blocks entirely past the upper bound.
        if let Some(end) = &self.end
            && entry.first_key.as_slice() >= end.as_slice()
        {
            self.block_iter = None;
            return Ok(false);
        }

        let bytes = self.segment.block_bytes(&entry)?;
        self.block_iter = Some(BlockIter::new(bytes));
        Ok(true)
    }
}

impl Iterator for SealedScan<'_> {
    type Item = Result<SealedRecord, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if self.block_iter.is_none() {
                match self.load_next_block() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }

            let Some(iter) = self.block_iter.as_mut() else {
                return None;
            };

            match iter.next() {
                Some(Ok(sealed)) => {
                    if self.skipping {
                        if sealed.key < self.start {
                            continue;
                        }
                        self.skipping = false;
                    }
                    if let Some(end) = &self.end
                        && sealed.key.as_slice() >= end.as_slice()
                    {
                        return None;
                    }
                    return Some(Ok(sealed));
                }
                Some(Err(e)) => {
                    self.failed = true;
                    self.segment.quarantine();
                    return Some(Err(SstError::Corrupt(format!("block decode failed: {e}"))));
                }
                None => {
                    self.block_iter = None;
                }
            }
        }
    }
}
