//! Leveled compaction — planning, merging, and segment production.
//!
//! # Level shape
//!
//! Level 0 receives memtable flushes and may hold segments with
//! overlapping key ranges, ordered newest-first by creation timestamp.
//! Levels 1..=max hold disjoint partitions of the keyspace. Level `N`'s
//! byte target is `level_base_bytes × ratio^(N-1)`.
//!
//! # Triggering and selection
//!
//! A compaction is due when level 0 holds more segments than the
//! threshold, or when a level's total bytes exceed its target. An L0
//! compaction consumes the whole level (its segments overlap each other,
//! and merging them newest-first is what implements the L0 tie-break
//! rule); a deeper-level compaction takes that level's oldest segment.
//! Either way, every target-level segment whose key range overlaps an
//! input joins the merge.
//!
//! # Merge semantics
//!
//! Inputs merge through a rank-aware k-way heap: keys ascending, source
//! rank ascending, where a lower rank is a newer layer (L0 segments rank
//! by creation timestamp, newest first). The first record seen for a key
//! wins. Merging never decrypts — the cleartext frame metadata carries
//! everything ordering and GC need.
//!
//! # Garbage collection
//!
//! Tombstones drop only when no level deeper than the target holds data:
//! same-level segments outside the merge are disjoint from the inputs,
//! so once nothing lives below, no shadowed version can resurrect.
//! Expired records drop under the same condition (last-level compaction).
//!
//! # Crash safety
//!
//! Outputs are built under temp names and renamed before the catalog
//! records the transition; the old segments are unlinked only after the
//! in-memory install succeeds.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::CatalogError;
use crate::record::SealedRecord;
use crate::sstable::{SealedScan, Segment, SegmentWriter, SstError};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Segment read or build failure.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    /// Catalog update failure.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Tuning
// ------------------------------------------------------------------------------------------------

/// Knobs the planner and executor need, extracted from the engine config.
#[derive(Debug, Clone)]
pub struct CompactionSettings {
    /// Maximum number of levels (indices `0..max_levels`).
    pub max_levels: u8,

    /// Size ratio between consecutive level targets.
    pub ratio: u64,

    /// Byte target of level 1.
    pub level_base_bytes: u64,

    /// L0 segment count that triggers compaction into L1.
    pub l0_segment_threshold: usize,

    /// Split compaction outputs when a segment reaches this size.
    pub segment_target_bytes: u64,

    /// Data block target size for output segments.
    pub block_size: usize,

    /// Bloom filter budget for output segments.
    pub bloom_bits_per_key: u32,
}

impl CompactionSettings {
    /// Byte target for level `n` (n ≥ 1): `base × ratio^(n-1)`.
    pub fn level_target_bytes(&self, n: u8) -> u64 {
        let exp = u32::from(n.saturating_sub(1));
        self.level_base_bytes
            .saturating_mul(self.ratio.saturating_pow(exp))
    }
}

// ------------------------------------------------------------------------------------------------
// Planning
// ------------------------------------------------------------------------------------------------

/// A selected compaction: source-level inputs plus every overlapping
/// segment of the target level.
#[derive(Debug)]
pub struct CompactionPlan {
    /// Level the inputs come from.
    pub source_level: u8,

    /// Level the merged output lands in.
    pub target_level: u8,

    /// Source segments, newest first (rank order for the merge).
    pub inputs: Vec<Arc<Segment>>,

    /// Target-level segments overlapping any input.
    pub overlapping: Vec<Arc<Segment>>,

    /// Whether tombstones and expired records may be dropped (no level
    /// deeper than the target holds data).
    pub drop_tombstones: bool,
}

impl CompactionPlan {
    /// IDs of every segment consumed by this plan.
    pub fn consumed_ids(&self) -> Vec<u64> {
        self.inputs
            .iter()
            .chain(self.overlapping.iter())
            .map(|s| s.id)
            .collect()
    }
}

/// Picks the next threshold-driven compaction, or `None` when every
/// level is within bounds. `levels[n]` holds level `n`'s segments.
pub fn plan_compaction(
    levels: &[Vec<Arc<Segment>>],
    settings: &CompactionSettings,
) -> Option<CompactionPlan> {
    let max = settings.max_levels as usize;

    // L0 first: segment count is what hurts reads.
    if levels
        .first()
        .is_some_and(|l0| l0.len() > settings.l0_segment_threshold)
    {
        return build_plan(levels, 0, settings);
    }

    for n in 1..max.min(levels.len()) {
        let total: u64 = levels[n].iter().map(|s| s.file_size()).sum();
        if total > settings.level_target_bytes(n as u8)
            && let Some(plan) = build_plan(levels, n, settings)
        {
            return Some(plan);
        }
    }
    None
}

/// Picks a compaction for a manual full pass: the shallowest populated
/// level whose data can still move down, regardless of thresholds.
/// Returns `None` once all data rests in a single level ≥ 1.
pub fn plan_forced_compaction(
    levels: &[Vec<Arc<Segment>>],
    settings: &CompactionSettings,
) -> Option<CompactionPlan> {
    let populated: Vec<usize> = levels
        .iter()
        .enumerate()
        .filter(|(_, segs)| !segs.is_empty())
        .map(|(n, _)| n)
        .collect();

    match populated.as_slice() {
        [] => None,
        // Everything already merged into one level below L0.
        [single] if *single >= 1 => None,
        [shallowest, ..] => build_plan(levels, *shallowest, settings),
    }
}

fn build_plan(
    levels: &[Vec<Arc<Segment>>],
    source: usize,
    settings: &CompactionSettings,
) -> Option<CompactionPlan> {
    if source + 1 >= settings.max_levels as usize {
        // Nothing below the last level to merge into.
        return None;
    }

    let inputs: Vec<Arc<Segment>> = if source == 0 {
        // Consume all of L0; its segments overlap each other. Newest
        // first so the merge rank implements the L0 tie-break.
        let mut segs = levels.first()?.clone();
        segs.sort_by(|a, b| b.id.cmp(&a.id));
        segs
    } else {
        // Deeper levels are disjoint: take the oldest segment.
        vec![levels.get(source)?.iter().min_by_key(|s| s.id).cloned()?]
    };
    if inputs.is_empty() {
        return None;
    }

    let target = source + 1;
    let overlapping: Vec<Arc<Segment>> = levels
        .get(target)
        .map(|segments| {
            segments
                .iter()
                .filter(|s| inputs.iter().any(|input| s.overlaps(input)))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let deeper_empty = levels
        .iter()
        .enumerate()
        .filter(|(n, _)| *n > target)
        .all(|(_, segs)| segs.is_empty());

    let plan = CompactionPlan {
        source_level: source as u8,
        target_level: target as u8,
        inputs,
        overlapping,
        drop_tombstones: deeper_empty,
    };

    debug!(
        source = plan.source_level,
        target = plan.target_level,
        inputs = plan.inputs.len(),
        overlapping = plan.overlapping.len(),
        drop_tombstones = plan.drop_tombstones,
        "compaction planned"
    );
    Some(plan)
}

// ------------------------------------------------------------------------------------------------
// Rank-aware k-way merge over sealed records
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    record: SealedRecord,
    rank: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.rank == other.rank
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (key ASC, rank ASC): reverse for BinaryHeap.
        self.record
            .key
            .cmp(&other.record.key)
            .then_with(|| self.rank.cmp(&other.rank))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge of sorted sealed-record streams.
///
/// Yields records in `(key ASC, rank ASC)` order, where rank 0 is the
/// newest source. Callers keep the first record per key.
pub struct SealedMerge<'a> {
    sources: Vec<SealedScan<'a>>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl<'a> SealedMerge<'a> {
    /// Builds the merge; `sources[rank]` must be sorted by key, with
    /// lower ranks holding newer data.
    pub fn new(mut sources: Vec<SealedScan<'a>>) -> Result<Self, SstError> {
        let mut heap = BinaryHeap::new();
        for (rank, source) in sources.iter_mut().enumerate() {
            if let Some(result) = source.next() {
                heap.push(HeapEntry {
                    record: result?,
                    rank,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
        })
    }
}

impl Iterator for SealedMerge<'_> {
    type Item = Result<SealedRecord, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = self.heap.pop()?;

        if let Some(result) = self.sources[entry.rank].next() {
            match result {
                Ok(record) => self.heap.push(HeapEntry {
                    record,
                    rank: entry.rank,
                }),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        Some(Ok(entry.record))
    }
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Merges the plan's inputs into a new set of non-overlapping segments
/// at the target level. Returns the produced segment paths.
///
/// Outputs split at `segment_target_bytes`. Superseded versions are
/// dropped; tombstones and expired records are dropped only when the
/// plan allows it.
pub fn run_compaction(
    plan: &CompactionPlan,
    dir: &Path,
    settings: &CompactionSettings,
    now_ns: u64,
) -> Result<Vec<PathBuf>, CompactionError> {
    let mut scans = Vec::with_capacity(plan.inputs.len() + plan.overlapping.len());
    for segment in &plan.inputs {
        scans.push(segment.iter_sealed()?);
    }
    for segment in &plan.overlapping {
        scans.push(segment.iter_sealed()?);
    }

    let merge = SealedMerge::new(scans)?;

    let expected: usize = plan
        .inputs
        .iter()
        .chain(plan.overlapping.iter())
        .map(|s| s.entry_count() as usize)
        .sum();

    let mut outputs: Vec<PathBuf> = Vec::new();
    let mut writer: Option<SegmentWriter> = None;
    let mut last_key: Option<Vec<u8>> = None;
    let mut kept: u64 = 0;
    let mut dropped: u64 = 0;

    for result in merge {
        let sealed = result?;

        // Superseded version of a key already decided this round.
        if last_key.as_deref() == Some(sealed.key.as_slice()) {
            dropped += 1;
            continue;
        }
        last_key = Some(sealed.key.clone());

        if plan.drop_tombstones && (sealed.deleted || sealed.is_expired(now_ns)) {
            dropped += 1;
            continue;
        }

        if writer.is_none() {
            writer = Some(SegmentWriter::create(
                dir,
                plan.target_level,
                expected,
                settings.block_size,
                settings.bloom_bits_per_key,
            )?);
        }
        let mut split_due = false;
        if let Some(target) = writer.as_mut() {
            target.add(&sealed)?;
            kept += 1;
            split_due = target.data_len() >= settings.segment_target_bytes;
        }
        if split_due && let Some(full) = writer.take() {
            outputs.push(full.finish()?);
        }
    }

    if let Some(tail) = writer.take() {
        outputs.push(tail.finish()?);
    }

    info!(
        source = plan.source_level,
        target = plan.target_level,
        kept,
        dropped,
        outputs = outputs.len(),
        "compaction executed"
    );
    Ok(outputs)
}
