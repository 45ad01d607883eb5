//! Catalog — persistent metadata authority for the LSM tree.
//!
//! The catalog is the single source of truth for:
//!
//! - which segment files exist and which level each belongs to,
//! - which archived WAL segments still back unflushed memtables and must
//!   be replayed after a crash.
//!
//! Filename-derived levels are only a recovery fallback for segments the
//! catalog has never heard of (e.g. a catalog lost to corruption).
//!
//! # Durability model
//!
//! Metadata is persisted as a miniature WAL + snapshot pair, both in the
//! DB root:
//!
//! - `catalog.log` — framed mutation events
//!   (`[u32 len][event bytes][u32 crc32(len || bytes)]`), fsynced per
//!   append. The CRC makes torn tail writes detectable; replay stops at
//!   the first bad frame.
//! - `CATALOG` — a checksummed snapshot of the whole state, written via
//!   tmp + fsync + atomic rename. [`Catalog::checkpoint`] writes a
//!   snapshot and truncates the log so recovery cost stays bounded.
//!
//! On open: load the snapshot when present and valid (a corrupt snapshot
//! is discarded with a warning — the log is ground truth), then replay
//! the log on top.
//!
//! # Thread safety
//!
//! State sits behind a `Mutex`; the log file behind another. Mutators
//! append to the log before touching in-memory state, so a crash between
//! the two replays the event instead of losing it.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Snapshot file name in the DB root.
pub const SNAPSHOT_FILE: &str = "CATALOG";

/// Event log file name in the DB root.
pub const LOG_FILE: &str = "catalog.log";

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot checksum mismatch.
    #[error("snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Data structures
// ------------------------------------------------------------------------------------------------

/// One segment known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Segment ID (creation timestamp in nanoseconds).
    pub id: u64,

    /// Level the segment belongs to.
    pub level: u8,

    /// Segment file path.
    pub path: PathBuf,
}

impl Encode for SegmentEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.id, buf)?;
        Encode::encode_to(&self.level, buf)?;
        Encode::encode_to(&self.path, buf)?;
        Ok(())
    }
}

impl Decode for SegmentEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (level, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { id, level, path }, offset))
    }
}

/// In-memory catalog state. Private fields; invariants enforced through
/// the [`Catalog`] API.
#[derive(Debug, Clone, PartialEq)]
struct CatalogData {
    /// Monotonically increasing snapshot version.
    version: u64,

    /// All live segments.
    segments: Vec<SegmentEntry>,

    /// Archived WAL segments still backing unflushed memtables.
    pending_wals: Vec<PathBuf>,

    /// Runtime-only: state diverged from the last snapshot.
    dirty: bool,
}

impl Default for CatalogData {
    fn default() -> Self {
        Self {
            version: 1,
            segments: Vec::new(),
            pending_wals: Vec::new(),
            dirty: false,
        }
    }
}

impl Encode for CatalogData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.version, buf)?;
        encoding::encode_vec(&self.segments, buf)?;
        encoding::encode_vec(&self.pending_wals, buf)?;
        Ok(())
    }
}

impl Decode for CatalogData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (segments, n) = encoding::decode_vec::<SegmentEntry>(&buf[offset..])?;
        offset += n;
        let (pending_wals, n) = encoding::decode_vec::<PathBuf>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                version,
                segments,
                pending_wals,
                dirty: false,
            },
            offset,
        ))
    }
}

/// One mutation applied to the catalog state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    /// A new segment entered a level (memtable flush or repair).
    AddSegment {
        /// The segment being added.
        entry: SegmentEntry,
    },

    /// A segment left the tree (repair replacement, manual removal).
    RemoveSegment {
        /// ID of the removed segment.
        id: u64,
    },

    /// Atomic compaction transition: new segments in, consumed ones out.
    Compaction {
        /// Segments produced by the compaction.
        added: Vec<SegmentEntry>,
        /// IDs of segments consumed by the compaction.
        removed: Vec<u64>,
    },

    /// An archived WAL segment now backs unflushed data.
    AddPendingWal {
        /// Archive path of the segment.
        path: PathBuf,
    },

    /// The archived WAL segment's data is durable in an SSTable.
    RemovePendingWal {
        /// Archive path of the segment.
        path: PathBuf,
    },
}

impl Encode for CatalogEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            CatalogEvent::AddSegment { entry } => {
                Encode::encode_to(&0u32, buf)?;
                Encode::encode_to(entry, buf)?;
            }
            CatalogEvent::RemoveSegment { id } => {
                Encode::encode_to(&1u32, buf)?;
                Encode::encode_to(id, buf)?;
            }
            CatalogEvent::Compaction { added, removed } => {
                Encode::encode_to(&2u32, buf)?;
                encoding::encode_vec(added, buf)?;
                encoding::encode_vec(removed, buf)?;
            }
            CatalogEvent::AddPendingWal { path } => {
                Encode::encode_to(&3u32, buf)?;
                Encode::encode_to(path, buf)?;
            }
            CatalogEvent::RemovePendingWal { path } => {
                Encode::encode_to(&4u32, buf)?;
                Encode::encode_to(path, buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for CatalogEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (entry, n) = SegmentEntry::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::AddSegment { entry }, offset))
            }
            1 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::RemoveSegment { id }, offset))
            }
            2 => {
                let (added, n) = encoding::decode_vec::<SegmentEntry>(&buf[offset..])?;
                offset += n;
                let (removed, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::Compaction { added, removed }, offset))
            }
            3 => {
                let (path, n) = PathBuf::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::AddPendingWal { path }, offset))
            }
            4 => {
                let (path, n) = PathBuf::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::RemovePendingWal { path }, offset))
            }
            _ => Err(EncodingError::InvalidTag {
                tag,
                type_name: "CatalogEvent",
            }),
        }
    }
}

/// Checksummed snapshot written to [`SNAPSHOT_FILE`].
#[derive(Debug)]
struct CatalogSnapshot {
    version: u64,
    data: CatalogData,
    checksum: u32,
}

impl Encode for CatalogSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        Encode::encode_to(&self.version, buf)?;
        Encode::encode_to(&self.data, buf)?;
        Encode::encode_to(&self.checksum, buf)?;
        Ok(())
    }
}

impl Decode for CatalogSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (data, n) = CatalogData::decode_from(&buf[offset..])?;
        offset += n;
        let (checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                version,
                data,
                checksum,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Catalog core
// ------------------------------------------------------------------------------------------------

/// The persistent catalog handle.
pub struct Catalog {
    dir: PathBuf,
    log: Mutex<File>,
    data: Mutex<CatalogData>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Catalog {
    /// Opens the catalog in `dir`: loads the snapshot when valid and
    /// replays the event log on top.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let mut data = CatalogData::default();

        if snapshot_path.exists() {
            match read_snapshot(&snapshot_path) {
                Ok(snap) => {
                    data = snap;
                    info!(path = %snapshot_path.display(), "catalog snapshot loaded");
                }
                Err(e) => {
                    // The log is ground truth; a bad snapshot only costs
                    // a longer replay.
                    warn!(path = %snapshot_path.display(), error = %e,
                          "catalog snapshot unreadable; replaying full log");
                    data = CatalogData::default();
                }
            }
        }

        let log_path = dir.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        let catalog = Self {
            dir,
            log: Mutex::new(log),
            data: Mutex::new(data),
        };
        catalog.replay_log()?;
        Ok(catalog)
    }

    /// Whether a valid snapshot or log with content exists in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(SNAPSHOT_FILE).exists()
            || dir
                .join(LOG_FILE)
                .metadata()
                .map(|m| m.len() > 0)
                .unwrap_or(false)
    }

    // --------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------

    /// All segments known to the catalog.
    pub fn segments(&self) -> Result<Vec<SegmentEntry>, CatalogError> {
        Ok(self.lock_data()?.segments.clone())
    }

    /// Archived WAL segments still pending replay.
    pub fn pending_wals(&self) -> Result<Vec<PathBuf>, CatalogError> {
        Ok(self.lock_data()?.pending_wals.clone())
    }

    /// Whether an archive path is pinned by pending-replay tracking.
    pub fn is_pending_wal(&self, path: &Path) -> bool {
        self.lock_data()
            .map(|d| d.pending_wals.iter().any(|p| p == path))
            .unwrap_or(false)
    }

    /// Whether in-memory state diverged from the last snapshot.
    pub fn is_dirty(&self) -> Result<bool, CatalogError> {
        Ok(self.lock_data()?.dirty)
    }

    // --------------------------------------------------------------------
    // Mutators — log first, then apply
    // --------------------------------------------------------------------

    /// Records a new segment.
    pub fn add_segment(&self, entry: SegmentEntry) -> Result<(), CatalogError> {
        self.commit(CatalogEvent::AddSegment { entry })
    }

    /// Removes a segment by ID.
    pub fn remove_segment(&self, id: u64) -> Result<(), CatalogError> {
        self.commit(CatalogEvent::RemoveSegment { id })
    }

    /// Atomically records a compaction transition.
    pub fn apply_compaction(
        &self,
        added: Vec<SegmentEntry>,
        removed: Vec<u64>,
    ) -> Result<(), CatalogError> {
        self.commit(CatalogEvent::Compaction { added, removed })
    }

    /// Pins an archived WAL segment for replay.
    pub fn add_pending_wal(&self, path: PathBuf) -> Result<(), CatalogError> {
        self.commit(CatalogEvent::AddPendingWal { path })
    }

    /// Unpins an archived WAL segment once its data is in an SSTable.
    pub fn remove_pending_wal(&self, path: &Path) -> Result<(), CatalogError> {
        self.commit(CatalogEvent::RemovePendingWal {
            path: path.to_path_buf(),
        })
    }

    /// Writes a snapshot and truncates the log.
    pub fn checkpoint(&self) -> Result<(), CatalogError> {
        // Hold the log lock across snapshot + truncate so no event can
        // slip in between and be lost.
        let mut log = self.lock_log()?;

        let snapshot = {
            let mut data = self.lock_data()?;
            data.version += 1;
            CatalogSnapshot {
                version: data.version,
                data: data.clone(),
                checksum: 0,
            }
        };

        // Serialize with checksum 0, then patch the trailing 4 bytes.
        let mut bytes = encoding::encode_to_vec(&snapshot)?;
        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        let checksum = hasher.finalize();
        let len = bytes.len();
        bytes[len - U32_SIZE..].copy_from_slice(&checksum.to_le_bytes());

        let tmp_path = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE))?;
        fsync_dir(&self.dir)?;

        log.set_len(0)?;
        log.sync_all()?;

        self.lock_data()?.dirty = false;
        info!(version = snapshot.version, "catalog checkpoint written");
        Ok(())
    }

    // --------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------

    fn commit(&self, event: CatalogEvent) -> Result<(), CatalogError> {
        let bytes = encoding::encode_to_vec(&event)?;
        let len = bytes.len() as u32;
        let len_bytes = len.to_le_bytes();

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&bytes);
        let checksum = hasher.finalize();

        {
            let mut log = self.lock_log()?;
            log.write_all(&len_bytes)?;
            log.write_all(&bytes)?;
            log.write_all(&checksum.to_le_bytes())?;
            log.sync_all()?;
        }

        self.apply(&event)?;
        debug!(?event, "catalog event committed");
        Ok(())
    }

    fn apply(&self, event: &CatalogEvent) -> Result<(), CatalogError> {
        let mut data = self.lock_data()?;
        match event {
            CatalogEvent::AddSegment { entry } => {
                // Idempotent on replay.
                if !data.segments.iter().any(|e| e.id == entry.id) {
                    data.segments.push(entry.clone());
                }
            }
            CatalogEvent::RemoveSegment { id } => {
                data.segments.retain(|e| e.id != *id);
            }
            CatalogEvent::Compaction { added, removed } => {
                for id in removed {
                    data.segments.retain(|e| e.id != *id);
                }
                for entry in added {
                    if !data.segments.iter().any(|e| e.id == entry.id) {
                        data.segments.push(entry.clone());
                    }
                }
            }
            CatalogEvent::AddPendingWal { path } => {
                if !data.pending_wals.iter().any(|p| p == path) {
                    data.pending_wals.push(path.clone());
                }
            }
            CatalogEvent::RemovePendingWal { path } => {
                data.pending_wals.retain(|p| p != path);
            }
        }
        data.dirty = true;
        Ok(())
    }

    fn replay_log(&self) -> Result<(), CatalogError> {
        let mut raw = Vec::new();
        {
            let mut log = self.lock_log()?;
            log.read_to_end(&mut raw)?;
        }

        let mut cursor = 0usize;
        let mut applied = 0u64;
        while cursor + U32_SIZE <= raw.len() {
            let mut len_bytes = [0u8; U32_SIZE];
            len_bytes.copy_from_slice(&raw[cursor..cursor + U32_SIZE]);
            let len = u32::from_le_bytes(len_bytes) as usize;

            let body_start = cursor + U32_SIZE;
            let crc_start = body_start + len;
            if crc_start + U32_SIZE > raw.len() {
                warn!(offset = cursor, "catalog log ends in a torn frame");
                break;
            }

            let body = &raw[body_start..crc_start];
            let mut crc_bytes = [0u8; U32_SIZE];
            crc_bytes.copy_from_slice(&raw[crc_start..crc_start + U32_SIZE]);
            let stored = u32::from_le_bytes(crc_bytes);

            let mut hasher = Crc32::new();
            hasher.update(&len_bytes);
            hasher.update(body);
            if hasher.finalize() != stored {
                warn!(offset = cursor, "catalog log frame checksum mismatch; stopping replay");
                break;
            }

            match encoding::decode_from_slice::<CatalogEvent>(body) {
                Ok((event, _)) => {
                    self.apply(&event)?;
                    applied += 1;
                }
                Err(e) => {
                    warn!(offset = cursor, error = %e, "undecodable catalog event; stopping replay");
                    break;
                }
            }

            cursor = crc_start + U32_SIZE;
        }

        debug!(applied, "catalog log replayed");
        Ok(())
    }

    fn lock_data(&self) -> Result<std::sync::MutexGuard<'_, CatalogData>, CatalogError> {
        self.data
            .lock()
            .map_err(|_| CatalogError::Internal("catalog data lock poisoned".into()))
    }

    fn lock_log(&self) -> Result<std::sync::MutexGuard<'_, File>, CatalogError> {
        self.log
            .lock()
            .map_err(|_| CatalogError::Internal("catalog log lock poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot I/O
// ------------------------------------------------------------------------------------------------

fn read_snapshot(path: &Path) -> Result<CatalogData, CatalogError> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    let (snap, _) = encoding::decode_from_slice::<CatalogSnapshot>(&raw)?;

    // Re-encode with checksum 0 and compare.
    let verify = CatalogSnapshot {
        version: snap.version,
        data: snap.data.clone(),
        checksum: 0,
    };
    let verify_bytes = encoding::encode_to_vec(&verify)?;
    let mut hasher = Crc32::new();
    hasher.update(&verify_bytes);
    if hasher.finalize() != snap.checksum {
        return Err(CatalogError::SnapshotChecksumMismatch);
    }

    Ok(snap.data)
}

fn fsync_dir(dir: &Path) -> Result<(), CatalogError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
