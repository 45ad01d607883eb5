//! Shared helpers for facade tests.

use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::cancel::CancelToken;
use crate::crypto::{KeySource, MasterKey};
use crate::db::{Db, DbConfig};

/// Initialize tracing controlled by `RUST_LOG`. First call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic 32-byte test key.
pub fn test_key() -> MasterKey {
    MasterKey::from_bytes(&[42u8; 32]).unwrap()
}

/// A second, different key for rotation / wrong-key tests.
pub fn other_key() -> MasterKey {
    MasterKey::from_bytes(&[77u8; 32]).unwrap()
}

/// Config with an explicit key, a quiet WAL ticker, and thresholds that
/// keep everything in the memtable unless a test asks otherwise.
pub fn test_config() -> DbConfig {
    init_tracing();
    DbConfig {
        memtable_size: 256 * 1024,
        block_size: 1024,
        wal_sync_interval: Duration::from_secs(3600),
        wal_rotation_threshold: 0,
        level_base_bytes: 16 * 1024,
        l0_segment_threshold: 4,
        segment_target_bytes: 64 * 1024,
        cache_capacity_bytes: Some(1024 * 1024),
        key_source: KeySource::Explicit(test_key()),
        batch_max_records: 64,
        ..DbConfig::default()
    }
}

/// Config whose tiny memtable rotates after a handful of writes.
pub fn small_memtable_config() -> DbConfig {
    DbConfig {
        memtable_size: 1024,
        ..test_config()
    }
}

pub fn open_db(path: &Path) -> Db {
    Db::open(path, test_config()).unwrap()
}

pub fn token() -> CancelToken {
    CancelToken::never()
}

/// Simulates a crash: makes the WAL durable, stops the facade workers,
/// then leaks the handle so no graceful close (flush, checkpoint) runs.
pub fn simulate_crash(db: Db) {
    db.sync().unwrap();
    db.shutdown.cancel();
    {
        let mut workers = db.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
    std::mem::forget(db);
}

/// Writes `count` keys with the given prefix.
pub fn fill_keys(db: &Db, prefix: &str, count: usize) {
    let t = token();
    for i in 0..count {
        let key = format!("{prefix}_{i:05}").into_bytes();
        let value = format!("value_of_{prefix}_{i:05}").into_bytes();
        db.put(key, value, &t).unwrap();
    }
}

/// Expected value written by [`fill_keys`].
pub fn expected_value(prefix: &str, i: usize) -> Vec<u8> {
    format!("value_of_{prefix}_{i:05}").into_bytes()
}
