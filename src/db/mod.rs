//! Database facade — lifecycle, crash recovery, and the public
//! key-value API.
//!
//! # Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Db                                │
//! │  ┌──────────┐  ┌───────────┐  ┌──────────────────────────┐  │
//! │  │  Active   │  │  Frozen    │  │  Levels                  │  │
//! │  │  memtable │  │  memtables │  │  L0 (overlapping, newest │  │
//! │  │           │  │            │  │  first) → L1..Lmax       │  │
//! │  └────┬─────┘  └─────┬─────┘  │  (disjoint)              │  │
//! │       │ seal          │ flush  └────────────┬─────────────┘  │
//! │       ▼               ▼                     │ compaction     │
//! │  ┌──────────────────────────┐  ┌────────────┴─────────────┐  │
//! │  │  WAL (+ archive)         │  │  Catalog (log + snapshot)│  │
//! │  └──────────────────────────┘  └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! One DB-wide `RwLock` guards the layer topology. Reads take the read
//! lock and proceed concurrently (the memtable is internally
//! concurrent, segments are immutable); writers — puts, deletes,
//! counters, batch application, memtable rotation, compaction
//! installation, key rotation — take the write lock and exclude them.
//! Flush and compaction do their I/O without any lock and re-acquire
//! the write lock only for the atomic in-memory swap.
//!
//! # Durability flow
//!
//! Writes seal the record, append it to the WAL, then update memtable
//! and cache. When the memtable crosses its threshold the WAL rotates
//! (the archived segment is pinned in the catalog as pending replay),
//! the memtable freezes, and a background worker builds a level-0
//! segment; only after the segment is durable and recorded does the
//! pending pin clear.
//!
//! # Crash recovery on open
//!
//! 1. Resolve the master key and build the cipher.
//! 2. Sweep `.tmp`/`.spill` leftovers and footer-less segments.
//! 3. Load the catalog; open its segments into their recorded levels;
//!    adopt stray segments by filename; delete undecodable ones.
//! 4. Replay pending WAL archives, then the active WAL, into a fresh
//!    memtable — stopping each file at its first invalid frame.
//! 5. Oversized recovered memtables are sealed for immediate flush.

pub mod batch;
pub mod keys;
pub mod tempfiles;

#[cfg(test)]
mod tests;

pub use batch::Batch;
pub use keys::KeysPage;

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheMode, ValueCache};
use crate::cancel::{CancelToken, Cancelled};
use crate::catalog::{Catalog, CatalogError, SegmentEntry};
use crate::clock;
use crate::compaction::{
    self, CompactionError, CompactionPlan, CompactionSettings, plan_compaction,
    plan_forced_compaction,
};
use crate::crypto::masterkey::KeyCachePolicy;
use crate::crypto::{Cipher, CipherError, KeyError, KeySource, MasterKey, MasterKeyManager};
use crate::memtable::{FrozenMemtable, Memtable};
use crate::record::{NO_EXPIRY, Record, SealedRecord};
use crate::sstable::{Segment, SegmentWriter, SstError, parse_segment_file_name};
use crate::wal::{RotateObserver, Wal, WalConfig, WalError};

use keys::KeySetMerge;
use tempfiles::TempFileTracker;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the database facade, aligned with the engine's
/// public error codes.
#[derive(Debug, Error)]
pub enum DbError {
    /// The key does not exist (or is deleted / expired).
    #[error("not found")]
    NotFound,

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The entity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Stored data failed structural validation (CRC, framing, magic).
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Stored data failed cryptographic authentication.
    #[error("encrypted payload failed authentication")]
    Encrypted,

    /// A bounded resource (batch slots, compaction slot) is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation was cancelled through its token.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine is in a state that forbids the operation (closed,
    /// already initialized with a different key, …).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Cancelled> for DbError {
    fn from(_: Cancelled) -> Self {
        DbError::Cancelled
    }
}

impl From<CipherError> for DbError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Authentication => DbError::Encrypted,
            CipherError::ChecksumMismatch => DbError::Corrupt("record checksum mismatch".into()),
            CipherError::InvalidKeyLength(n) => {
                DbError::InvalidArgument(format!("invalid key length {n}"))
            }
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<KeyError> for DbError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::AlreadyInitialized => DbError::FailedPrecondition(e.to_string()),
            KeyError::MissingKey => DbError::FailedPrecondition(e.to_string()),
            KeyError::InvalidKeyLength(_) | KeyError::Decode(_) => {
                DbError::InvalidArgument(e.to_string())
            }
            KeyError::Shamir(_) => DbError::FailedPrecondition(e.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<WalError> for DbError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Cipher(inner) => inner.into(),
            WalError::Encoding(inner) => DbError::Corrupt(inner.to_string()),
            WalError::Closed => DbError::FailedPrecondition("WAL is closed".into()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<SstError> for DbError {
    fn from(e: SstError) -> Self {
        match e {
            SstError::Cipher(inner) => inner.into(),
            SstError::Corrupt(msg) => DbError::Corrupt(msg),
            SstError::Encoding(inner) => DbError::Corrupt(inner.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<CatalogError> for DbError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::SnapshotChecksumMismatch => DbError::Corrupt(e.to_string()),
            CatalogError::Encoding(inner) => DbError::Corrupt(inner.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<CompactionError> for DbError {
    fn from(e: CompactionError) -> Self {
        match e {
            CompactionError::Sst(inner) => inner.into(),
            CompactionError::Catalog(inner) => inner.into(),
            CompactionError::Io(inner) => DbError::Internal(inner.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Write listener — optional post-durability collaborator
// ------------------------------------------------------------------------------------------------

/// Optional collaborator (e.g. a search indexer) notified after a write
/// is durable in the core. Listener failures never roll the core back;
/// they are surfaced to the caller as-is.
pub trait WriteListener: Send + Sync {
    /// A put (or counter update) became durable.
    fn on_put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError>;

    /// A delete became durable.
    fn on_delete(&self, key: &[u8]) -> Result<(), DbError>;
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Engine configuration. All knobs carry defaults; construct with
/// `DbConfig { memtable_size: …, ..DbConfig::default() }`.
#[derive(Debug)]
pub struct DbConfig {
    /// Memtable byte threshold before rotation (256 MiB).
    pub memtable_size: usize,

    /// SSTable data block target size (4 KiB).
    pub block_size: usize,

    /// Bloom filter budget per key (10 bits ≈ 1% false positives).
    pub bloom_bits_per_key: u32,

    /// WAL append buffer capacity (10 MiB).
    pub wal_buffer_size: usize,

    /// WAL flush/rotation ticker period (1 s).
    pub wal_sync_interval: Duration,

    /// WAL size-based rotation threshold; 0 disables.
    pub wal_rotation_threshold: u64,

    /// WAL age-based rotation interval; `None` disables.
    pub wal_rotation_interval: Option<Duration>,

    /// Archived WAL segments to keep (newest first); 0 disables.
    pub wal_retention_max_count: usize,

    /// Archived WAL max age in days; 0 disables.
    pub wal_retention_max_age_days: u64,

    /// Number of levels (7).
    pub max_levels: u8,

    /// Size ratio between consecutive level targets (4).
    pub compaction_ratio: u64,

    /// Byte target of level 1.
    pub level_base_bytes: u64,

    /// L0 segment count that triggers compaction.
    pub l0_segment_threshold: usize,

    /// Split compaction outputs at this segment size.
    pub segment_target_bytes: u64,

    /// Value cache sizing strategy.
    pub cache_mode: CacheMode,

    /// Explicit cache capacity override in bytes.
    pub cache_capacity_bytes: Option<usize>,

    /// Where the master key comes from.
    pub key_source: KeySource,

    /// Master-key in-memory retention policy.
    pub key_cache: KeyCachePolicy,

    /// Maximum records a [`Batch`] may buffer.
    pub batch_max_records: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            memtable_size: 256 * 1024 * 1024,
            block_size: 4096,
            bloom_bits_per_key: 10,
            wal_buffer_size: 10 * 1024 * 1024,
            wal_sync_interval: Duration::from_secs(1),
            wal_rotation_threshold: 64 * 1024 * 1024,
            wal_rotation_interval: None,
            wal_retention_max_count: 8,
            wal_retention_max_age_days: 7,
            max_levels: 7,
            compaction_ratio: 4,
            level_base_bytes: 256 * 1024 * 1024,
            l0_segment_threshold: 4,
            segment_target_bytes: 8 * 1024 * 1024,
            cache_mode: CacheMode::Balanced,
            cache_capacity_bytes: None,
            key_source: KeySource::Auto,
            key_cache: KeyCachePolicy::default(),
            batch_max_records: 1024,
        }
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Active memtable bytes.
    pub memtable_bytes: usize,

    /// Frozen memtables awaiting flush.
    pub frozen_count: usize,

    /// Segment count per level.
    pub level_segment_counts: Vec<usize>,

    /// Total on-disk segment bytes.
    pub total_segment_bytes: u64,

    /// Bytes held by the value cache.
    pub cache_bytes: usize,
}

// ------------------------------------------------------------------------------------------------
// Rotation ledger — WAL → catalog bridge
// ------------------------------------------------------------------------------------------------

/// Observes WAL rotations: pins the archived segment in the catalog
/// (durably, before the rename) and queues it for assignment to the
/// memtable that owns its records at the next seal.
struct RotationLedger {
    catalog: Arc<Catalog>,
    unassigned: Mutex<Vec<PathBuf>>,
}

impl RotationLedger {
    fn drain(&self) -> Vec<PathBuf> {
        match self.unassigned.lock() {
            Ok(mut g) => g.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }
}

impl RotateObserver for RotationLedger {
    fn before_rotate(&self, archived: &Path) -> Result<(), WalError> {
        self.catalog
            .add_pending_wal(archived.to_path_buf())
            .map_err(|e| WalError::Internal(format!("catalog pin failed: {e}")))?;
        match self.unassigned.lock() {
            Ok(mut g) => g.push(archived.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().push(archived.to_path_buf()),
        }
        Ok(())
    }

    fn is_pinned(&self, archived: &Path) -> bool {
        self.catalog.is_pending_wal(archived)
    }
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// Layer topology guarded by the DB-wide RwLock.
struct DbState {
    active: Arc<Memtable>,
    frozen: Vec<FrozenMemtable>,
    levels: Vec<Vec<Arc<Segment>>>,
}

/// The freshest record found for a key, from whichever layer answered.
enum Found {
    Mem(Record),
    Disk(SealedRecord),
}

impl Found {
    fn deleted(&self) -> bool {
        match self {
            Found::Mem(r) => r.deleted,
            Found::Disk(s) => s.deleted,
        }
    }

    fn expires_at(&self) -> u64 {
        match self {
            Found::Mem(r) => r.expires_at,
            Found::Disk(s) => s.expires_at,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        let expires = self.expires_at();
        expires != NO_EXPIRY && expires < now
    }

    fn into_value(self, cipher: &Cipher) -> Result<Vec<u8>, DbError> {
        match self {
            Found::Mem(r) => Ok(r.value),
            Found::Disk(s) => Ok(cipher.open(&s)?.value),
        }
    }
}

struct DbShared {
    path: PathBuf,
    config: DbConfig,
    key_manager: MasterKeyManager,
    cipher: Cipher,
    wal: Wal,
    catalog: Arc<Catalog>,
    ledger: Arc<RotationLedger>,
    state: RwLock<DbState>,
    cache: ValueCache,
    listener: RwLock<Option<Arc<dyn WriteListener>>>,
    temp_files: TempFileTracker,
    flush_lock: Mutex<()>,
    flush_tx: Sender<()>,
    compact_tx: Sender<()>,
    compacting: AtomicBool,
    closed: AtomicBool,
}

// ------------------------------------------------------------------------------------------------
// Db — public handle
// ------------------------------------------------------------------------------------------------

/// The encrypted key-value store.
///
/// Open with [`Db::open`]; all operations are safe to call from
/// multiple threads. Background workers (WAL ticker, memtable flusher,
/// compactor) stop on [`Db::close`] (also invoked from `Drop`).
pub struct Db {
    shared: Arc<DbShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancelToken,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a vault rooted at `path`.
    pub fn open(path: impl AsRef<Path>, mut config: DbConfig) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| DbError::Internal(e.to_string()))?;

        // 1. Master key and cipher.
        let key_source = std::mem::replace(&mut config.key_source, KeySource::Auto);
        let key_manager =
            MasterKeyManager::new(&path, key_source).with_policy(config.key_cache);
        let master_key = key_manager.obtain()?;
        let cipher = Cipher::new(master_key.as_bytes())?;

        // 2. Sweep crash leftovers before anything trusts the directory.
        tempfiles::sweep_stale_temp_files(&path).map_err(|e| DbError::Internal(e.to_string()))?;

        // 3. Catalog and segment discovery.
        let catalog = Arc::new(Catalog::open(&path)?);
        let levels = Self::load_levels(&path, &catalog, config.max_levels)?;

        // 4. WAL with the rotation ledger wired into the catalog.
        let ledger = Arc::new(RotationLedger {
            catalog: Arc::clone(&catalog),
            unassigned: Mutex::new(Vec::new()),
        });
        let wal_config = WalConfig {
            buffer_capacity: config.wal_buffer_size,
            sync_interval: config.wal_sync_interval,
            rotation_threshold: config.wal_rotation_threshold,
            rotation_interval: config.wal_rotation_interval,
            retention_max_count: config.wal_retention_max_count,
            retention_max_age_days: config.wal_retention_max_age_days,
        };
        let wal = Wal::open(
            &path,
            wal_config,
            Box::new(LedgerObserver(Arc::clone(&ledger))),
        )?;

        // 5. Replay pending archives, then the active WAL.
        let active = Arc::new(Memtable::new());
        for pending in catalog.pending_wals()? {
            if !pending.exists() {
                // Pinned before the rename, crashed before it happened.
                warn!(path = %pending.display(), "pending WAL segment missing; unpinning");
                catalog.remove_pending_wal(&pending)?;
                continue;
            }
            let replay = Wal::replay_file(&pending, &cipher)?;
            Self::replay_into(&active, replay);
        }
        let replay = wal.replay(&cipher)?;
        Self::replay_into(&active, replay);

        // Replayed pending segments now back the recovered memtable;
        // queue them so the next seal hands them to its frozen table
        // and the flush finally unpins them.
        {
            let mut unassigned = match ledger.unassigned.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for pending in catalog.pending_wals()? {
                if !unassigned.contains(&pending) {
                    unassigned.push(pending);
                }
            }
        }

        let cache_capacity = config
            .cache_capacity_bytes
            .unwrap_or_else(|| config.cache_mode.capacity_bytes());

        let (flush_tx, flush_rx) = channel::bounded::<()>(16);
        let (compact_tx, compact_rx) = channel::bounded::<()>(16);

        let shared = Arc::new(DbShared {
            path: path.clone(),
            config,
            key_manager,
            cipher,
            wal,
            catalog,
            ledger,
            state: RwLock::new(DbState {
                active,
                frozen: Vec::new(),
                levels,
            }),
            cache: ValueCache::new(cache_capacity),
            listener: RwLock::new(None),
            temp_files: TempFileTracker::new(),
            flush_lock: Mutex::new(()),
            flush_tx,
            compact_tx,
            compacting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        // 6. A fat recovered memtable flushes immediately.
        {
            let mut state = shared.write_state()?;
            if state.active.approximate_size() >= shared.config.memtable_size {
                info!("recovered memtable over threshold; sealing for immediate flush");
                shared.seal_active(&mut state)?;
            }
        }

        let shutdown = CancelToken::new();
        let mut workers = Vec::with_capacity(2);
        workers.push(spawn_flush_worker(
            Arc::clone(&shared),
            flush_rx,
            shutdown.clone(),
        )?);
        workers.push(spawn_compaction_worker(
            Arc::clone(&shared),
            compact_rx,
            shutdown.clone(),
        )?);

        let db = Self {
            shared,
            workers: Mutex::new(workers),
            shutdown,
        };
        if !db.shared.frozen_empty()? {
            db.shared.signal_flush();
        }

        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    fn load_levels(
        path: &Path,
        catalog: &Catalog,
        max_levels: u8,
    ) -> Result<Vec<Vec<Arc<Segment>>>, DbError> {
        let mut levels: Vec<Vec<Arc<Segment>>> = vec![Vec::new(); max_levels as usize];
        let mut known: HashSet<u64> = HashSet::new();

        for entry in catalog.segments()? {
            match Segment::open(&entry.path) {
                Ok(mut segment) => {
                    segment.level = entry.level;
                    known.insert(entry.id);
                    let level = (entry.level as usize).min(levels.len() - 1);
                    levels[level].push(Arc::new(segment));
                }
                Err(e) => {
                    // Renames are atomic, so an unopenable segment is
                    // damage, not a crash artifact. Drop it.
                    warn!(path = %entry.path.display(), error = %e,
                          "catalogued segment unreadable; removing");
                    catalog.remove_segment(entry.id)?;
                    let _ = fs::remove_file(&entry.path);
                }
            }
        }

        // Adopt stray segments the catalog has never heard of (lost
        // catalog, crash between rename and record). Level comes from
        // the filename.
        for dir_entry in fs::read_dir(path).map_err(|e| DbError::Internal(e.to_string()))? {
            let dir_entry = dir_entry.map_err(|e| DbError::Internal(e.to_string()))?;
            let file_path = dir_entry.path();
            let Some((level, id)) = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_file_name)
            else {
                continue;
            };
            if known.contains(&id) {
                continue;
            }
            match Segment::open(&file_path) {
                Ok(segment) => {
                    info!(path = %file_path.display(), level, "adopting uncatalogued segment");
                    catalog.add_segment(SegmentEntry {
                        id,
                        level,
                        path: file_path.clone(),
                    })?;
                    let slot = (level as usize).min(levels.len() - 1);
                    levels[slot].push(Arc::new(segment));
                }
                Err(e) => {
                    // No valid footer: a partial file from a crash.
                    warn!(path = %file_path.display(), error = %e,
                          "deleting segment without a valid footer");
                    let _ = fs::remove_file(&file_path);
                }
            }
        }

        if let Some(l0) = levels.first_mut() {
            l0.sort_by(|a, b| b.id.cmp(&a.id));
        }
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.min_key().cmp(b.min_key()));
        }
        Ok(levels)
    }

    fn replay_into(memtable: &Memtable, replay: crate::wal::WalReplay<'_>) {
        let mut applied = 0u64;
        for item in replay {
            match item {
                Ok(record) => {
                    memtable.apply_replayed(record);
                    applied += 1;
                }
                Err((offset, e)) => {
                    // Serve the prefix that validated.
                    warn!(offset, error = %e, "WAL replay stopped at invalid frame");
                    break;
                }
            }
        }
        debug!(applied, "WAL segment replayed");
    }

    // --------------------------------------------------------------------
    // Point operations
    // --------------------------------------------------------------------

    /// Inserts or overwrites a key. Last writer wins.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, token: &CancelToken) -> Result<(), DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(&key)?;
        self.shared.write_record(Record::new_put(key, value, NO_EXPIRY))
    }

    /// Same as [`Db::put`] with an expiry of `now + ttl`; a zero `ttl`
    /// disables expiry.
    pub fn put_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
        token: &CancelToken,
    ) -> Result<(), DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(&key)?;
        let expires_at = if ttl.is_zero() {
            NO_EXPIRY
        } else {
            clock::now_nanos().saturating_add(ttl.as_nanos() as u64)
        };
        self.shared
            .write_record(Record::new_put(key, value, expires_at))
    }

    /// Returns the freshest non-tombstoned, non-expired value, or `None`.
    pub fn get(&self, key: &[u8], token: &CancelToken) -> Result<Option<Vec<u8>>, DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(key)?;

        if let Some(value) = self.shared.cache.get(key) {
            return Ok(Some(value));
        }

        let state = self.shared.read_state()?;
        let Some(found) = self.shared.lookup(&state, key)? else {
            return Ok(None);
        };
        if found.deleted() || found.is_expired(clock::now_nanos()) {
            return Ok(None);
        }
        // The cache is write-through only: populating it from the read
        // path would race with concurrent writers' removals.
        let value = found.into_value(&self.shared.cipher)?;
        Ok(Some(value))
    }

    /// Writes a tombstone. Idempotent: succeeds whether or not the key
    /// exists.
    pub fn delete(&self, key: Vec<u8>, token: &CancelToken) -> Result<(), DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(&key)?;
        self.shared.write_record(Record::new_tombstone(key))
    }

    /// Whether a live (non-deleted, non-expired) value exists.
    pub fn has(&self, key: &[u8], token: &CancelToken) -> Result<bool, DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(key)?;

        if self.shared.cache.get(key).is_some() {
            return Ok(true);
        }
        let state = self.shared.read_state()?;
        match self.shared.lookup(&state, key)? {
            Some(found) => Ok(!found.deleted() && !found.is_expired(clock::now_nanos())),
            None => Ok(false),
        }
    }

    /// Remaining time to live: `Ok(Some(d))` for an expiring key,
    /// `Ok(None)` for a key without expiry, `Err(NotFound)` otherwise.
    pub fn ttl(&self, key: &[u8], token: &CancelToken) -> Result<Option<Duration>, DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(key)?;

        let state = self.shared.read_state()?;
        let now = clock::now_nanos();
        match self.shared.lookup(&state, key)? {
            None => Err(DbError::NotFound),
            Some(found) if found.deleted() || found.is_expired(now) => Err(DbError::NotFound),
            Some(found) => {
                let expires = found.expires_at();
                if expires == NO_EXPIRY {
                    Ok(None)
                } else {
                    Ok(Some(Duration::from_nanos(expires - now)))
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // Counters
    // --------------------------------------------------------------------

    /// Atomically adds `step` to an integer value, treating an absent
    /// key as 0. Returns the new value.
    ///
    /// The read-modify-write holds the DB write lock so concurrent
    /// counters serialize.
    pub fn incr(&self, key: Vec<u8>, step: i64, token: &CancelToken) -> Result<i64, DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        validate_key(&key)?;

        let mut state = self.shared.write_state()?;
        let now = clock::now_nanos();

        let current: i64 = match self.shared.lookup(&state, &key)? {
            None => 0,
            Some(found) if found.deleted() || found.is_expired(now) => 0,
            Some(found) => {
                let raw = found.into_value(&self.shared.cipher)?;
                std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok())
                    .ok_or_else(|| {
                        DbError::InvalidArgument("existing value is not an integer".into())
                    })?
            }
        };

        let next = current
            .checked_add(step)
            .ok_or_else(|| DbError::InvalidArgument("counter overflow".into()))?;

        let record = Record::new_put(key, next.to_string().into_bytes(), NO_EXPIRY);
        if state.active.approximate_size() + record.approximate_size()
            > self.shared.config.memtable_size
            && !state.active.is_empty()
        {
            self.shared.seal_active(&mut state)?;
            self.shared.signal_flush();
        }
        self.shared.apply_write(&state, record)?;
        Ok(next)
    }

    /// Atomically subtracts `step`; see [`Db::incr`].
    pub fn decr(&self, key: Vec<u8>, step: i64, token: &CancelToken) -> Result<i64, DbError> {
        let negated = step
            .checked_neg()
            .ok_or_else(|| DbError::InvalidArgument("step overflow".into()))?;
        self.incr(key, negated, token)
    }

    // --------------------------------------------------------------------
    // Enumeration
    // --------------------------------------------------------------------

    /// Live keys matching a glob pattern (`*` wildcard), sorted.
    pub fn keys(&self, pattern: &str, token: &CancelToken) -> Result<Vec<Vec<u8>>, DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        let merged = self.shared.merge_key_sets(token)?;
        Ok(merged.into_live_keys(Some(pattern.as_bytes())))
    }

    /// One page of all live keys plus the total count.
    pub fn keys_page(
        &self,
        offset: usize,
        limit: usize,
        token: &CancelToken,
    ) -> Result<KeysPage, DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        let merged = self.shared.merge_key_sets(token)?;
        Ok(keys::paginate(merged.into_live_keys(None), offset, limit))
    }

    // --------------------------------------------------------------------
    // Batch
    // --------------------------------------------------------------------

    /// Starts a buffered batch writer.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self, self.shared.config.batch_max_records)
    }

    // --------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------

    /// Forces the WAL buffer to disk. After this returns, every prior
    /// successful write survives a crash.
    pub fn sync(&self) -> Result<(), DbError> {
        self.shared.ensure_open()?;
        self.shared.wal.sync()?;
        Ok(())
    }

    /// Seals the active memtable (if non-empty) and flushes every frozen
    /// memtable to level-0 segments before returning.
    pub fn flush(&self, token: &CancelToken) -> Result<(), DbError> {
        token.check()?;
        self.shared.ensure_open()?;
        {
            let mut state = self.shared.write_state()?;
            self.shared.seal_active(&mut state)?;
        }
        while self.shared.flush_oldest_frozen()? {
            token.check()?;
        }
        Ok(())
    }

    /// Runs compaction to completion: repeatedly merges the shallowest
    /// populated level downward until all data rests in a single level
    /// at or below L1, dropping spent tombstones and expired records
    /// along the way.
    pub fn compact(&self, token: &CancelToken) -> Result<(), DbError> {
        self.shared.ensure_open()?;

        // Single compaction at a time; wait for the background slot.
        while self.shared.compacting.swap(true, Ordering::SeqCst) {
            if token.wait_timeout(Duration::from_millis(20)) {
                return Err(DbError::Cancelled);
            }
        }
        let result = (|| {
            loop {
                token.check()?;
                let plan = {
                    let state = self.shared.read_state()?;
                    plan_forced_compaction(&state.levels, &self.shared.settings())
                };
                match plan {
                    Some(plan) => self.shared.execute_compaction(plan)?,
                    None => return Ok(()),
                }
            }
        })();
        self.shared.compacting.store(false, Ordering::SeqCst);
        result
    }

    /// Repairs quarantined segments: each one is rewritten with every
    /// record that still validates, swapped into the catalog, and the
    /// damaged file removed. Returns the number of segments repaired.
    pub fn repair(&self, token: &CancelToken) -> Result<usize, DbError> {
        token.check()?;
        self.shared.ensure_open()?;

        let broken: Vec<Arc<Segment>> = {
            let state = self.shared.read_state()?;
            state
                .levels
                .iter()
                .flatten()
                .filter(|s| s.is_read_broken())
                .cloned()
                .collect()
        };

        let mut repaired = 0usize;
        for damaged in broken {
            token.check()?;
            let report = crate::sstable::repair::repair_segment(
                &damaged,
                &self.shared.path,
                &self.shared.cipher,
                self.shared.config.block_size,
                self.shared.config.bloom_bits_per_key,
            )?;

            let replacement = match &report.new_path {
                Some(path) => {
                    self.shared.temp_files.register(path);
                    Some(Arc::new(Segment::open(path)?))
                }
                None => None,
            };

            {
                let mut state = self.shared.write_state()?;
                for level in state.levels.iter_mut() {
                    level.retain(|s| s.id != damaged.id);
                }
                if let Some(segment) = &replacement {
                    let slot = (damaged.level as usize).min(state.levels.len() - 1);
                    state.levels[slot].push(Arc::clone(segment));
                    if slot == 0 {
                        state.levels[0].sort_by(|a, b| b.id.cmp(&a.id));
                    } else {
                        state.levels[slot].sort_by(|a, b| a.min_key().cmp(b.min_key()));
                    }
                }
            }

            let added = replacement
                .iter()
                .map(|s| SegmentEntry {
                    id: s.id,
                    level: damaged.level,
                    path: s.path.clone(),
                })
                .collect();
            self.shared
                .catalog
                .apply_compaction(added, vec![damaged.id])?;
            if let Some(segment) = &replacement {
                self.shared.temp_files.release(&segment.path);
            }
            if let Err(e) = fs::remove_file(&damaged.path) {
                warn!(path = %damaged.path.display(), error = %e,
                      "failed to remove damaged segment after repair");
            }
            info!(
                old = %damaged.path.display(),
                recovered = report.recovered,
                lost = report.lost,
                "segment repaired"
            );
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Replaces the master key and rebuilds the cipher atomically.
    /// Existing ciphertext is not rewritten; a rotating deployment that
    /// re-encrypts history lives above the core.
    pub fn refresh_master_key(&self, material: &[u8]) -> Result<(), DbError> {
        self.shared.ensure_open()?;
        let key = MasterKey::from_bytes(material)?;

        // Exclusive swap: no reader may hold the old cipher mid-record.
        let _state = self.shared.write_state()?;
        self.shared.key_manager.refresh(key.clone())?;
        self.shared.cipher.rotate(key.as_bytes())?;
        self.shared.cache.clear();
        info!("master key refreshed");
        Ok(())
    }

    /// Drops the cached master key from memory (zeroized).
    pub fn clear_key_cache(&self) {
        self.shared.key_manager.clear_cache();
    }

    /// Attaches the optional write-time collaborator.
    pub fn set_write_listener(&self, listener: Arc<dyn WriteListener>) {
        match self.shared.listener.write() {
            Ok(mut slot) => *slot = Some(listener),
            Err(poisoned) => *poisoned.into_inner() = Some(listener),
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        let state = self.shared.read_state()?;
        let level_segment_counts: Vec<usize> = state.levels.iter().map(|l| l.len()).collect();
        let total_segment_bytes = state
            .levels
            .iter()
            .flatten()
            .map(|s| s.file_size())
            .sum();
        Ok(DbStats {
            memtable_bytes: state.active.approximate_size(),
            frozen_count: state.frozen.len(),
            level_segment_counts,
            total_segment_bytes,
            cache_bytes: self.shared.cache.total_bytes(),
        })
    }

    /// Flushes everything, stops the workers, checkpoints the catalog,
    /// and releases the cache. Idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(path = %self.shared.path.display(), "closing database");

        self.shutdown.cancel();
        let _ = self.shared.flush_tx.try_send(());
        let _ = self.shared.compact_tx.try_send(());
        {
            let mut workers = match self.workers.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }

        // Flush all in-memory data so reopen starts clean.
        {
            let mut state = self.shared.write_state()?;
            self.shared.seal_active(&mut state)?;
        }
        while self.shared.flush_oldest_frozen()? {}

        self.shared.wal.sync()?;
        self.shared.wal.close()?;
        self.shared.catalog.checkpoint()?;
        self.shared.cache.clear();
        self.shared.temp_files.cleanup();

        // Directory metadata (renames, unlinks) must survive power loss.
        for dir in [
            self.shared.path.clone(),
            self.shared.path.join(crate::wal::WAL_ARCHIVE_DIR),
        ] {
            if let Ok(handle) = File::open(&dir) {
                let _ = handle.sync_all();
            }
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "database close failed on drop");
        }
    }
}

fn validate_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

/// Newtype so the WAL can own a boxed observer while the engine keeps
/// its `Arc` handle on the ledger.
struct LedgerObserver(Arc<RotationLedger>);

impl RotateObserver for LedgerObserver {
    fn before_rotate(&self, archived: &Path) -> Result<(), WalError> {
        self.0.before_rotate(archived)
    }

    fn is_pinned(&self, archived: &Path) -> bool {
        self.0.is_pinned(archived)
    }
}

// ------------------------------------------------------------------------------------------------
// Shared internals
// ------------------------------------------------------------------------------------------------

impl DbShared {
    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::FailedPrecondition("database is closed".into()));
        }
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, DbState>, DbError> {
        self.state
            .read()
            .map_err(|_| DbError::Internal("state lock poisoned".into()))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, DbState>, DbError> {
        self.state
            .write()
            .map_err(|_| DbError::Internal("state lock poisoned".into()))
    }

    fn frozen_empty(&self) -> Result<bool, DbError> {
        Ok(self.read_state()?.frozen.is_empty())
    }

    fn settings(&self) -> CompactionSettings {
        CompactionSettings {
            max_levels: self.config.max_levels,
            ratio: self.config.compaction_ratio,
            level_base_bytes: self.config.level_base_bytes,
            l0_segment_threshold: self.config.l0_segment_threshold,
            segment_target_bytes: self.config.segment_target_bytes,
            block_size: self.config.block_size,
            bloom_bits_per_key: self.config.bloom_bits_per_key,
        }
    }

    fn signal_flush(&self) {
        let _ = self.flush_tx.try_send(());
    }

    fn signal_compact(&self) {
        let _ = self.compact_tx.try_send(());
    }

    // --------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------

    /// Routes a record through the memtable-threshold check.
    ///
    /// Writers hold the write lock, so the WAL append, memtable insert,
    /// and cache update land atomically with respect to readers.
    fn write_record(&self, record: Record) -> Result<(), DbError> {
        let mut state = self.write_state()?;
        let projected = state.active.approximate_size() + record.approximate_size();
        let mut sealed = false;
        if projected > self.config.memtable_size && !state.active.is_empty() {
            self.seal_active(&mut state)?;
            sealed = true;
        }
        let result = self.apply_write(&state, record);
        drop(state);
        if sealed {
            self.signal_flush();
        }
        result
    }

    /// WAL-first write: seal, append, then memtable + cache + listener.
    fn apply_write(&self, state: &DbState, record: Record) -> Result<(), DbError> {
        let sealed = self.cipher.seal(&record)?;
        self.wal.append(&sealed)?;

        if record.deleted || record.expires_at != NO_EXPIRY {
            self.cache.remove(&record.key);
        } else {
            self.cache.put(&record.key, &record.value);
        }

        let listener = match self.listener.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let downstream = listener.map(|l| {
            if record.deleted {
                l.on_delete(&record.key)
            } else {
                l.on_put(&record.key, &record.value)
            }
        });

        state.active.insert(record);

        // Core data is durable regardless of collaborator failures.
        match downstream {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Rotates the WAL and freezes the active memtable. Caller holds the
    /// write lock.
    fn seal_active(&self, state: &mut DbState) -> Result<(), DbError> {
        if state.active.is_empty() {
            return Ok(());
        }
        // Rotation pins the archived segment in the catalog first, so a
        // crash here replays it.
        self.wal.rotate()?;
        let segments = self.ledger.drain();

        let sealed = std::mem::replace(&mut state.active, Arc::new(Memtable::new()));
        debug!(
            bytes = sealed.approximate_size(),
            entries = sealed.len(),
            wal_segments = segments.len(),
            "memtable sealed"
        );
        state.frozen.insert(0, FrozenMemtable::new(sealed, segments));
        Ok(())
    }

    // --------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------

    /// Finds the freshest record for `key` across all layers:
    /// active → frozen (newest first) → L0 (newest first) → L1..Lmax.
    fn lookup(&self, state: &DbState, key: &[u8]) -> Result<Option<Found>, DbError> {
        if let Some(record) = state.active.get(key) {
            return Ok(Some(Found::Mem(record)));
        }
        for frozen in &state.frozen {
            if let Some(record) = frozen.get(key) {
                return Ok(Some(Found::Mem(record)));
            }
        }

        if let Some(l0) = state.levels.first() {
            for segment in l0 {
                if let Some(sealed) = segment.get_sealed(key)? {
                    return Ok(Some(Found::Disk(sealed)));
                }
            }
        }

        for level in state.levels.iter().skip(1) {
            if let Some(segment) = find_level_segment(level, key)
                && let Some(sealed) = segment.get_sealed(key)?
            {
                return Ok(Some(Found::Disk(sealed)));
            }
        }
        Ok(None)
    }

    /// Newest-wins merge of the key sets of every layer.
    fn merge_key_sets(&self, token: &CancelToken) -> Result<KeySetMerge, DbError> {
        let state = self.read_state()?;
        let now = clock::now_nanos();
        let mut merge = KeySetMerge::new();

        for record in state.active.snapshot() {
            merge.offer(&record.key, !record.deleted && !record.is_expired(now));
        }
        for frozen in &state.frozen {
            token.check()?;
            for record in frozen.table.snapshot() {
                merge.offer(&record.key, !record.deleted && !record.is_expired(now));
            }
        }

        for level in &state.levels {
            for segment in level {
                token.check()?;
                for item in segment.iter_sealed()? {
                    let sealed = item?;
                    let live = !sealed.deleted && !sealed.is_expired(now);
                    merge.offer(&sealed.key, live);
                }
            }
        }
        Ok(merge)
    }

    // --------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------

    /// Flushes the oldest frozen memtable into a level-0 segment.
    /// Returns `false` when there was nothing to flush.
    fn flush_oldest_frozen(&self) -> Result<bool, DbError> {
        let _flush_guard = self
            .flush_lock
            .lock()
            .map_err(|_| DbError::Internal("flush lock poisoned".into()))?;

        let (snapshot, wal_segments, sealed_at) = {
            let state = self.read_state()?;
            let Some(oldest) = state.frozen.last() else {
                return Ok(false);
            };
            (
                oldest.table.snapshot(),
                oldest.wal_segments.clone(),
                oldest.sealed_at,
            )
        };

        // Build outside any lock.
        let new_segment = if snapshot.is_empty() {
            None
        } else {
            let mut writer = SegmentWriter::create(
                &self.path,
                0,
                snapshot.len(),
                self.config.block_size,
                self.config.bloom_bits_per_key,
            )?;
            for record in &snapshot {
                writer.add(&self.cipher.seal(record)?)?;
            }
            let path = writer.finish()?;
            // Tracked until the catalog records it, so an aborted flush
            // cannot strand the file.
            self.temp_files.register(&path);
            Some(Arc::new(Segment::open(&path)?))
        };

        // Atomic install.
        {
            let mut state = self.write_state()?;
            match state.frozen.iter().position(|f| f.sealed_at == sealed_at) {
                Some(pos) => {
                    state.frozen.remove(pos);
                }
                None => {
                    // Another flusher beat us to it; drop our build.
                    if let Some(segment) = &new_segment {
                        let _ = fs::remove_file(&segment.path);
                        self.temp_files.release(&segment.path);
                    }
                    return Ok(true);
                }
            }
            if let Some(segment) = &new_segment
                && let Some(l0) = state.levels.first_mut()
            {
                l0.insert(0, Arc::clone(segment));
            }
        }

        // Durable bookkeeping after the swap: a crash in between means
        // the segment is re-adopted by filename and the pending WAL
        // replays harmlessly on top.
        if let Some(segment) = &new_segment {
            self.catalog.add_segment(SegmentEntry {
                id: segment.id,
                level: 0,
                path: segment.path.clone(),
            })?;
            self.temp_files.release(&segment.path);
            info!(path = %segment.path.display(), entries = segment.entry_count(),
                  "memtable flushed to level 0");
        }
        for wal_segment in &wal_segments {
            self.catalog.remove_pending_wal(wal_segment)?;
        }

        self.signal_compact();
        Ok(true)
    }

    // --------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------

    /// One threshold-driven compaction round. Returns `false` when no
    /// level is over budget.
    fn compact_threshold_once(&self) -> Result<bool, DbError> {
        if self.compacting.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = (|| {
            let plan = {
                let state = self.read_state()?;
                plan_compaction(&state.levels, &self.settings())
            };
            match plan {
                Some(plan) => {
                    self.execute_compaction(plan)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })();
        self.compacting.store(false, Ordering::SeqCst);
        result
    }

    /// Runs and installs one planned compaction.
    fn execute_compaction(&self, plan: CompactionPlan) -> Result<(), DbError> {
        let settings = self.settings();
        let outputs =
            compaction::run_compaction(&plan, &self.path, &settings, clock::now_nanos())?;

        let mut new_segments = Vec::with_capacity(outputs.len());
        for path in &outputs {
            // Tracked until the catalog transition commits.
            self.temp_files.register(path);
            new_segments.push(Arc::new(Segment::open(path)?));
        }
        let removed = plan.consumed_ids();

        // Atomic catalog swap under the write lock.
        {
            let mut state = self.write_state()?;
            for level in state.levels.iter_mut() {
                level.retain(|s| !removed.contains(&s.id));
            }
            let target = plan.target_level as usize;
            if let Some(level) = state.levels.get_mut(target) {
                for segment in &new_segments {
                    level.push(Arc::clone(segment));
                }
                level.sort_by(|a, b| a.min_key().cmp(b.min_key()));
            }
        }

        let added: Vec<SegmentEntry> = new_segments
            .iter()
            .map(|s| SegmentEntry {
                id: s.id,
                level: plan.target_level,
                path: s.path.clone(),
            })
            .collect();
        self.catalog.apply_compaction(added, removed)?;
        self.catalog.checkpoint()?;
        for path in &outputs {
            self.temp_files.release(path);
        }

        // Old files go only after the swap; readers that still hold the
        // Arc keep a valid mapping until they drop it.
        for segment in plan.inputs.iter().chain(plan.overlapping.iter()) {
            if let Err(e) = fs::remove_file(&segment.path) {
                warn!(path = %segment.path.display(), error = %e,
                      "failed to remove compacted segment");
            }
        }
        Ok(())
    }
}

fn find_level_segment<'a>(level: &'a [Arc<Segment>], key: &[u8]) -> Option<&'a Arc<Segment>> {
    // Levels ≥ 1 are sorted by min_key and disjoint.
    let idx = level.partition_point(|s| s.min_key() <= key);
    if idx == 0 {
        return None;
    }
    let candidate = &level[idx - 1];
    (key <= candidate.max_key()).then_some(candidate)
}

// ------------------------------------------------------------------------------------------------
// Workers
// ------------------------------------------------------------------------------------------------

fn spawn_flush_worker(
    shared: Arc<DbShared>,
    rx: Receiver<()>,
    shutdown: CancelToken,
) -> Result<JoinHandle<()>, DbError> {
    thread::Builder::new()
        .name("db-flush".into())
        .spawn(move || {
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                loop {
                    match shared.flush_oldest_frozen() {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            error!(error = %e, "background flush failed");
                            break;
                        }
                    }
                }
            }
        })
        .map_err(|e| DbError::Internal(format!("failed to spawn flush worker: {e}")))
}

fn spawn_compaction_worker(
    shared: Arc<DbShared>,
    rx: Receiver<()>,
    shutdown: CancelToken,
) -> Result<JoinHandle<()>, DbError> {
    thread::Builder::new()
        .name("db-compact".into())
        .spawn(move || {
            loop {
                match rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                loop {
                    match shared.compact_threshold_once() {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            error!(error = %e, "background compaction failed");
                            break;
                        }
                    }
                }
            }
        })
        .map_err(|e| DbError::Internal(format!("failed to spawn compaction worker: {e}")))
}
