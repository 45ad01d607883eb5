//! Write-Ahead Log — buffered, encrypted, rotating.
//!
//! Every mutation is framed as a [`SealedRecord`] and appended here before
//! it becomes visible in the memtable. The WAL is the only durability
//! mechanism between a write and the SSTable flush that later absorbs it.
//!
//! # Durability contract
//!
//! Any record for which [`Wal::append`] returned `Ok` **and** for which a
//! [`Wal::sync`] has subsequently completed (implicitly on buffer
//! overflow, on the periodic tick, on batch flush, or explicitly) is
//! replayed on crash recovery until its containing memtable has been
//! durably installed as an SSTable.
//!
//! # On-disk layout
//!
//! The active file is `wal.log` in the DB root; rotated segments move to
//! `wal_archive/wal_<ns>.log`. A segment is a plain concatenation of
//! record frames (see [`crate::record`]) with no file header — replay
//! starts at offset 0 and stops cleanly at EOF or at the first frame that
//! fails to decode, decrypt, or checksum.
//!
//! # Buffering and background flush
//!
//! Appends land in an in-memory buffer (target capacity ≈10 MiB). When
//! the buffer crosses capacity it is swapped for a fresh one and the
//! sealed buffer is handed to a background flusher thread over a bounded
//! channel; the flusher writes and fsyncs. When the channel is saturated
//! the appender performs the write and fsync itself rather than blocking
//! behind the flusher.
//!
//! A ticker thread fires every sync interval, forcing a flush and
//! evaluating rotation policy and archive retention.
//!
//! # Rotation
//!
//! Rotation (size threshold or age interval) atomically renames the
//! active file into the archive with a nanosecond-precision name and
//! reopens a fresh `wal.log` at the same path. The [`RotateObserver`] is
//! invoked *before* the rename so the caller can durably record the new
//! archive segment as pending replay; segments the observer reports as
//! pinned are never pruned by retention.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::cancel::CancelToken;
use crate::clock;
use crate::crypto::{Cipher, CipherError};
use crate::encoding::{self, Encode, EncodingError};
use crate::record::{BufferPool, Record, SealedRecord};

/// Active WAL file name inside the DB root.
pub const WAL_FILE: &str = "wal.log";

/// Archive directory name inside the DB root.
pub const WAL_ARCHIVE_DIR: &str = "wal_archive";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Decryption or checksum failure during replay.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Operation on a closed WAL.
    #[error("WAL is closed")]
    Closed,

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tunables for buffering, rotation, and retention.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Append buffer target capacity before a background flush is queued.
    pub buffer_capacity: usize,

    /// Period of the flush/rotation ticker.
    pub sync_interval: Duration,

    /// Rotate when the segment (file + buffer) reaches this many bytes.
    /// `0` disables size-based rotation.
    pub rotation_threshold: u64,

    /// Rotate when the active segment reaches this age. `None` disables
    /// age-based rotation.
    pub rotation_interval: Option<Duration>,

    /// Keep at most this many archived segments (newest kept). `0`
    /// disables count-based pruning.
    pub retention_max_count: usize,

    /// Prune archived segments older than this many days. `0` disables
    /// age-based pruning.
    pub retention_max_age_days: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10 * 1024 * 1024,
            sync_interval: Duration::from_secs(1),
            rotation_threshold: 64 * 1024 * 1024,
            rotation_interval: None,
            retention_max_count: 8,
            retention_max_age_days: 7,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RotateObserver
// ------------------------------------------------------------------------------------------------

/// Narrow capability through which the engine learns about rotations.
///
/// `before_rotate` runs before the active file is renamed, so the
/// observer can durably record the archive segment as pending replay;
/// an error aborts the rotation. `is_pinned` protects segments that are
/// still needed for crash recovery from retention pruning.
pub trait RotateObserver: Send + Sync {
    /// Called with the destination path before the rename happens.
    fn before_rotate(&self, archived: &Path) -> Result<(), WalError>;

    /// Whether the archived segment must survive retention pruning.
    fn is_pinned(&self, archived: &Path) -> bool;
}

/// Observer that records nothing and pins nothing.
pub struct NoopRotateObserver;

impl RotateObserver for NoopRotateObserver {
    fn before_rotate(&self, _archived: &Path) -> Result<(), WalError> {
        Ok(())
    }

    fn is_pinned(&self, _archived: &Path) -> bool {
        false
    }
}

// ------------------------------------------------------------------------------------------------
// Flush plumbing
// ------------------------------------------------------------------------------------------------

type SharedFile = Arc<Mutex<File>>;

enum FlushJob {
    /// A sealed append buffer destined for the file it was cut from.
    Buffer { file: SharedFile, data: Vec<u8> },
    /// Terminates the flusher thread.
    Shutdown,
}

/// Counts in-flight background flushes so `sync` can wait them out.
#[derive(Debug)]
struct PendingFlushes {
    count: Mutex<usize>,
    cv: Condvar,
}

impl PendingFlushes {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn inc(&self) {
        let mut count = match self.count.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *count += 1;
    }

    fn dec(&self) {
        let mut count = match self.count.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *count = count.saturating_sub(1);
        self.cv.notify_all();
    }

    fn wait_zero(&self) {
        let mut count = match self.count.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        while *count > 0 {
            count = match self.cv.wait(count) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WAL core
// ------------------------------------------------------------------------------------------------

struct WalInner {
    file: SharedFile,
    buffer: Vec<u8>,
    opened_at: Instant,
}

struct WalShared {
    path: PathBuf,
    archive_dir: PathBuf,
    config: WalConfig,
    inner: Mutex<WalInner>,
    flush_tx: Sender<FlushJob>,
    pending: PendingFlushes,
    pool: BufferPool,
    observer: Box<dyn RotateObserver>,
    closed: AtomicBool,
}

/// The write-ahead log handle.
///
/// Owns two worker threads: a flusher draining sealed buffers and a
/// ticker forcing periodic syncs and rotation checks. Both stop on
/// [`Wal::close`] (also invoked from `Drop`).
pub struct Wal {
    shared: Arc<WalShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancelToken,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens (or creates) the active WAL under `db_path` and starts the
    /// background workers.
    pub fn open(
        db_path: impl AsRef<Path>,
        config: WalConfig,
        observer: Box<dyn RotateObserver>,
    ) -> Result<Self, WalError> {
        let db_path = db_path.as_ref();
        let path = db_path.join(WAL_FILE);
        let archive_dir = db_path.join(WAL_ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        info!(path = %path.display(), "WAL opened");

        let (flush_tx, flush_rx) = channel::bounded::<FlushJob>(4);

        let shared = Arc::new(WalShared {
            path,
            archive_dir,
            config,
            inner: Mutex::new(WalInner {
                file: Arc::new(Mutex::new(file)),
                buffer: Vec::new(),
                opened_at: Instant::now(),
            }),
            flush_tx,
            pending: PendingFlushes::new(),
            pool: BufferPool::new(),
            observer,
            closed: AtomicBool::new(false),
        });

        let shutdown = CancelToken::new();
        let mut workers = Vec::with_capacity(2);

        workers.push(spawn_flusher(Arc::clone(&shared), flush_rx)?);
        workers.push(spawn_ticker(Arc::clone(&shared), shutdown.clone())?);

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            shutdown,
        })
    }

    /// Appends one sealed record to the WAL buffer.
    ///
    /// When the buffer crosses its capacity it is handed to the
    /// background flusher; if the flush channel is saturated the write
    /// happens synchronously on the calling thread.
    pub fn append(&self, sealed: &SealedRecord) -> Result<(), WalError> {
        self.shared.append(sealed)
    }

    /// Drains the buffer to the file, fsyncs, and waits for any queued
    /// background flushes. After `sync` returns, everything previously
    /// appended is durable.
    pub fn sync(&self) -> Result<(), WalError> {
        self.shared.sync()
    }

    /// Rotates the active segment into the archive and reopens a fresh
    /// `wal.log`, returning the archived path.
    pub fn rotate(&self) -> Result<PathBuf, WalError> {
        self.shared.rotate()
    }

    /// Applies rotation policy (size/age thresholds); returns the
    /// archived path when a rotation happened.
    pub fn maybe_rotate(&self) -> Result<Option<PathBuf>, WalError> {
        self.shared.maybe_rotate()
    }

    /// Prunes archived segments by retention count and age, skipping
    /// segments the observer pins.
    pub fn enforce_retention(&self) -> Result<(), WalError> {
        self.shared.enforce_retention()
    }

    /// Current segment size: bytes on disk plus bytes buffered.
    pub fn segment_len(&self) -> Result<u64, WalError> {
        self.shared.segment_len()
    }

    /// Streams decrypted records out of the active WAL file.
    ///
    /// The iterator yields the valid prefix and then a single error for
    /// the first frame that fails to decode, decrypt, or checksum; the
    /// caller decides whether to proceed with partial recovery.
    pub fn replay<'c>(&self, cipher: &'c Cipher) -> Result<WalReplay<'c>, WalError> {
        WalReplay::from_file(&self.shared.path, cipher)
    }

    /// Replays an arbitrary segment file (archived segments pending
    /// flush at crash time).
    pub fn replay_file<'c>(path: &Path, cipher: &'c Cipher) -> Result<WalReplay<'c>, WalError> {
        WalReplay::from_file(path, cipher)
    }

    /// Flushes, fsyncs, and stops the workers. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Final drain while append is already rejected.
        self.shared.sync_internal()?;

        self.shutdown.cancel();
        let _ = self.shared.flush_tx.send(FlushJob::Shutdown);

        let mut workers = match self.workers.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        info!(path = %self.shared.path.display(), "WAL closed");
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "WAL close failed on drop");
        }
    }
}

impl WalShared {
    fn append(&self, sealed: &SealedRecord) -> Result<(), WalError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed);
        }

        let mut frame = self.pool.acquire();
        sealed.encode_to(&mut frame)?;

        let mut inner = self.lock_inner()?;
        inner.buffer.extend_from_slice(&frame);
        self.pool.release(frame);

        trace!(buffered = inner.buffer.len(), "WAL record buffered");

        if inner.buffer.len() >= self.config.buffer_capacity {
            let sealed_buf = std::mem::take(&mut inner.buffer);
            let file = Arc::clone(&inner.file);

            self.pending.inc();
            match self.flush_tx.try_send(FlushJob::Buffer {
                file: Arc::clone(&file),
                data: sealed_buf,
            }) {
                Ok(()) => {
                    debug!("WAL buffer handed to background flusher");
                }
                Err(TrySendError::Full(FlushJob::Buffer { data, .. })) => {
                    // Saturated flusher: do the write ourselves.
                    self.pending.dec();
                    debug!("WAL flush channel saturated; writing synchronously");
                    write_and_sync(&file, &data)?;
                }
                Err(_) => {
                    self.pending.dec();
                    return Err(WalError::Internal("flush channel disconnected".into()));
                }
            }
        }

        Ok(())
    }

    fn sync(&self) -> Result<(), WalError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed);
        }
        self.sync_internal()
    }

    fn sync_internal(&self) -> Result<(), WalError> {
        {
            let mut inner = self.lock_inner()?;
            if !inner.buffer.is_empty() {
                let data = std::mem::take(&mut inner.buffer);
                let file = Arc::clone(&inner.file);
                drop(inner);
                write_and_sync(&file, &data)?;
            } else {
                let file = Arc::clone(&inner.file);
                drop(inner);
                let guard = lock_file(&file)?;
                guard.sync_all()?;
            }
        }
        self.pending.wait_zero();
        Ok(())
    }

    fn rotate(&self) -> Result<PathBuf, WalError> {
        let mut inner = self.lock_inner()?;

        // Drain the buffer into the outgoing segment first.
        if !inner.buffer.is_empty() {
            let data = std::mem::take(&mut inner.buffer);
            write_and_sync(&inner.file, &data)?;
        }

        let archived = self
            .archive_dir
            .join(format!("wal_{}.log", clock::now_nanos()));

        // Let the engine durably note the segment before it exists under
        // its archive name; recovery tolerates a noted-but-missing file.
        self.observer.before_rotate(&archived)?;

        // Queued flush jobs hold the same file handle, so late writes
        // still land in the archived inode after the rename.
        self.pending.wait_zero();

        {
            let guard = lock_file(&inner.file)?;
            guard.sync_all()?;
        }

        fs::rename(&self.path, &archived)?;

        let fresh = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        inner.file = Arc::new(Mutex::new(fresh));
        inner.opened_at = Instant::now();

        info!(archived = %archived.display(), "WAL rotated");
        Ok(archived)
    }

    fn maybe_rotate(&self) -> Result<Option<PathBuf>, WalError> {
        let (size, age) = {
            let inner = self.lock_inner()?;
            let file_len = {
                let guard = lock_file(&inner.file)?;
                guard.metadata()?.len()
            };
            (file_len + inner.buffer.len() as u64, inner.opened_at.elapsed())
        };

        let size_due = self.config.rotation_threshold > 0 && size >= self.config.rotation_threshold;
        let age_due = self
            .config
            .rotation_interval
            .is_some_and(|interval| age >= interval);

        if size_due || age_due {
            debug!(size, ?age, "WAL rotation policy triggered");
            return self.rotate().map(Some);
        }
        Ok(None)
    }

    fn enforce_retention(&self) -> Result<(), WalError> {
        let mut archived: Vec<(PathBuf, SystemTime)> = fs::read_dir(&self.archive_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with("wal_") && n.ends_with(".log"))
            })
            .filter_map(|e| {
                let modified = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((e.path(), modified))
            })
            .collect();

        // Newest first.
        archived.sort_by(|a, b| b.1.cmp(&a.1));

        let now = SystemTime::now();
        let max_age = if self.config.retention_max_age_days > 0 {
            Some(Duration::from_secs(self.config.retention_max_age_days * 24 * 60 * 60))
        } else {
            None
        };

        for (idx, (path, modified)) in archived.iter().enumerate() {
            if self.observer.is_pinned(path) {
                continue;
            }

            let over_count =
                self.config.retention_max_count > 0 && idx >= self.config.retention_max_count;
            let over_age = max_age.is_some_and(|limit| {
                now.duration_since(*modified)
                    .map(|age| age > limit)
                    .unwrap_or(false)
            });

            if over_count || over_age {
                match fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "pruned archived WAL segment"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to prune WAL segment"),
                }
            }
        }

        Ok(())
    }

    fn segment_len(&self) -> Result<u64, WalError> {
        let inner = self.lock_inner()?;
        let file_len = {
            let guard = lock_file(&inner.file)?;
            guard.metadata()?.len()
        };
        Ok(file_len + inner.buffer.len() as u64)
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, WalInner>, WalError> {
        self.inner
            .lock()
            .map_err(|_| WalError::Internal("WAL lock poisoned".into()))
    }
}

fn lock_file(file: &SharedFile) -> Result<std::sync::MutexGuard<'_, File>, WalError> {
    file.lock()
        .map_err(|_| WalError::Internal("WAL file lock poisoned".into()))
}

fn write_and_sync(file: &SharedFile, data: &[u8]) -> Result<(), WalError> {
    let mut guard = lock_file(file)?;
    guard.write_all(data)?;
    guard.sync_all()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Workers
// ------------------------------------------------------------------------------------------------

fn spawn_flusher(
    shared: Arc<WalShared>,
    rx: Receiver<FlushJob>,
) -> Result<JoinHandle<()>, WalError> {
    thread::Builder::new()
        .name("wal-flusher".into())
        .spawn(move || {
            for job in rx.iter() {
                match job {
                    FlushJob::Buffer { file, data } => {
                        if let Err(e) = write_and_sync(&file, &data) {
                            error!(error = %e, "background WAL flush failed");
                        }
                        shared.pending.dec();
                    }
                    FlushJob::Shutdown => break,
                }
            }
            trace!("WAL flusher stopped");
        })
        .map_err(WalError::Io)
}

fn spawn_ticker(
    shared: Arc<WalShared>,
    shutdown: CancelToken,
) -> Result<JoinHandle<()>, WalError> {
    thread::Builder::new()
        .name("wal-ticker".into())
        .spawn(move || {
            let interval = shared.config.sync_interval;
            loop {
                if shutdown.wait_timeout(interval) {
                    break;
                }
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = shared.sync_internal() {
                    warn!(error = %e, "periodic WAL sync failed");
                }
                match shared.maybe_rotate() {
                    Ok(Some(_)) | Ok(None) => {}
                    Err(e) => warn!(error = %e, "WAL rotation check failed"),
                }
                if let Err(e) = shared.enforce_retention() {
                    warn!(error = %e, "WAL retention enforcement failed");
                }
            }
            trace!("WAL ticker stopped");
        })
        .map_err(WalError::Io)
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Streaming replay over one WAL segment file.
///
/// Yields `Ok(record)` for each frame that decodes, authenticates, and
/// checksums; the first failure yields one `Err` carrying the failing
/// offset, after which the iterator is exhausted.
pub struct WalReplay<'c> {
    data: Vec<u8>,
    offset: usize,
    cipher: &'c Cipher,
    failed: bool,
}

impl<'c> WalReplay<'c> {
    fn from_file(path: &Path, cipher: &'c Cipher) -> Result<Self, WalError> {
        let data = fs::read(path)?;
        debug!(path = %path.display(), len = data.len(), "WAL replay started");
        Ok(Self {
            data,
            offset: 0,
            cipher,
            failed: false,
        })
    }

    /// Byte offset of the next frame (or of the failure).
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }
}

impl Iterator for WalReplay<'_> {
    type Item = Result<Record, (u64, WalError)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let frame_start = self.offset as u64;
        let sealed = match encoding::decode_from_slice::<SealedRecord>(&self.data[self.offset..]) {
            Ok((sealed, consumed)) => {
                self.offset += consumed;
                sealed
            }
            Err(e) => {
                self.failed = true;
                warn!(offset = frame_start, error = %e, "WAL frame decode failed");
                return Some(Err((frame_start, e.into())));
            }
        };

        match self.cipher.open(&sealed) {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.failed = true;
                warn!(offset = frame_start, error = %e, "WAL frame failed authentication");
                Some(Err((frame_start, e.into())))
            }
        }
    }
}
