//! Temp-file tracking — guarantees scratch files never outlive the engine.
//!
//! Compaction, segment builds, and export/preview workflows create
//! temporary files next to the data they produce. Registering them here
//! guarantees unlink on explicit cleanup or when the tracker drops with
//! the engine, so a crash-free shutdown never strands scratch data.
//! (Crash leftovers are swept separately at startup by extension.)

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

/// Registry of scratch files pending cleanup.
#[derive(Debug, Default)]
pub struct TempFileTracker {
    files: Mutex<HashSet<PathBuf>>,
}

impl TempFileTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a path for unlink-on-cleanup.
    pub fn register(&self, path: impl Into<PathBuf>) {
        self.lock().insert(path.into());
    }

    /// Unregisters a path (it graduated to a permanent file).
    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Unlinks every registered file.
    pub fn cleanup(&self) {
        let mut files = self.lock();
        for path in files.drain() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "temp file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "temp file removal failed"),
            }
        }
    }

    /// Number of files currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        match self.files.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TempFileTracker {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Deletes crash leftovers (`*.tmp`, `*.spill`) in `dir`.
pub fn sweep_stale_temp_files(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_scratch = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext == "tmp" || ext == "spill");
        if path.is_file() && is_scratch {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "stale temp file swept"),
                Err(e) => warn!(path = %path.display(), error = %e, "stale temp sweep failed"),
            }
        }
    }
    Ok(())
}
