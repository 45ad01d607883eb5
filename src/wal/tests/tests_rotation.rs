//! Rotation and retention behavior.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::wal::{RotateObserver, WAL_ARCHIVE_DIR, WAL_FILE, Wal, WalError};

use super::helpers::*;

/// Observer that records rotations and optionally pins everything.
struct RecordingObserver {
    seen: Arc<Mutex<Vec<PathBuf>>>,
    pin_all: bool,
}

impl RecordingObserver {
    fn new(pin_all: bool) -> (Box<Self>, Arc<Mutex<Vec<PathBuf>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Self {
                seen: Arc::clone(&seen),
                pin_all,
            }),
            seen,
        )
    }
}

impl RotateObserver for RecordingObserver {
    fn before_rotate(&self, archived: &Path) -> Result<(), WalError> {
        self.seen.lock().unwrap().push(archived.to_path_buf());
        Ok(())
    }

    fn is_pinned(&self, _archived: &Path) -> bool {
        self.pin_all
    }
}

fn archived_segments(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.join(WAL_ARCHIVE_DIR))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    paths
}

#[test]
fn rotate_archives_and_reopens_fresh() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let wal = open_wal(tmp.path(), quiet_config());

    wal.append(&sealed_put(&cipher, b"before", b"rotation"))
        .unwrap();
    let archived = wal.rotate().unwrap();

    assert!(archived.starts_with(tmp.path().join(WAL_ARCHIVE_DIR)));
    assert!(archived.exists());
    // The archived segment holds the drained record.
    let replayed: Vec<_> = Wal::replay_file(&archived, &cipher)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].key, b"before");

    // Fresh active file is empty and writable.
    assert_eq!(
        std::fs::metadata(tmp.path().join(WAL_FILE)).unwrap().len(),
        0
    );
    wal.append(&sealed_put(&cipher, b"after", b"rotation"))
        .unwrap();
    wal.sync().unwrap();
    assert_eq!(replay_all(&wal, &cipher).len(), 1);
}

#[test]
fn observer_sees_every_rotation() {
    let tmp = TempDir::new().unwrap();
    let (observer, seen) = RecordingObserver::new(false);
    let wal = Wal::open(tmp.path(), quiet_config(), observer).unwrap();

    let archived = wal.rotate().unwrap();

    assert_eq!(seen.lock().unwrap().clone(), vec![archived]);
}

#[test]
fn size_threshold_triggers_maybe_rotate() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let mut config = quiet_config();
    config.rotation_threshold = 128;
    let wal = open_wal(tmp.path(), config);

    assert!(wal.maybe_rotate().unwrap().is_none());

    wal.append(&sealed_put(&cipher, b"key", &[0u8; 256])).unwrap();
    let rotated = wal.maybe_rotate().unwrap();
    assert!(rotated.is_some());
}

#[test]
fn age_interval_triggers_maybe_rotate() {
    let tmp = TempDir::new().unwrap();
    let mut config = quiet_config();
    config.rotation_interval = Some(Duration::from_millis(10));
    let wal = open_wal(tmp.path(), config);

    std::thread::sleep(Duration::from_millis(30));
    assert!(wal.maybe_rotate().unwrap().is_some());
}

#[test]
fn retention_prunes_by_count_keeping_newest() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let mut config = quiet_config();
    config.retention_max_count = 2;
    let wal = open_wal(tmp.path(), config);

    for i in 0..4u8 {
        wal.append(&sealed_put(&cipher, &[i], b"x")).unwrap();
        wal.rotate().unwrap();
        // Distinct mtimes so newest-first ordering is deterministic.
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(archived_segments(tmp.path()).len(), 4);

    wal.enforce_retention().unwrap();
    assert_eq!(archived_segments(tmp.path()).len(), 2);
}

#[test]
fn retention_never_prunes_pinned_segments() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let mut config = quiet_config();
    config.retention_max_count = 1;
    let (observer, _seen) = RecordingObserver::new(true);
    let wal = Wal::open(tmp.path(), config, observer).unwrap();

    for i in 0..3u8 {
        wal.append(&sealed_put(&cipher, &[i], b"x")).unwrap();
        wal.rotate().unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }

    wal.enforce_retention().unwrap();
    // Everything pinned: nothing may be deleted.
    assert_eq!(archived_segments(tmp.path()).len(), 3);
}

#[test]
fn rotation_preserves_every_synced_record_across_segments() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let wal = open_wal(tmp.path(), quiet_config());

    wal.append(&sealed_put(&cipher, b"one", b"1")).unwrap();
    let first = wal.rotate().unwrap();
    wal.append(&sealed_put(&cipher, b"two", b"2")).unwrap();
    let second = wal.rotate().unwrap();
    wal.append(&sealed_put(&cipher, b"three", b"3")).unwrap();
    wal.sync().unwrap();

    let mut keys = Vec::new();
    for segment in [&first, &second] {
        for record in Wal::replay_file(segment, &cipher).unwrap() {
            keys.push(record.unwrap().key);
        }
    }
    for record in wal.replay(&cipher).unwrap() {
        keys.push(record.unwrap().key);
    }
    assert_eq!(keys, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}
