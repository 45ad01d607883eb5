//! Shared helpers for WAL tests.

use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::crypto::Cipher;
use crate::record::{NO_EXPIRY, Record, SealedRecord};
use crate::wal::{NoopRotateObserver, Wal, WalConfig};

/// Initialize tracing controlled by `RUST_LOG`. First call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic test cipher.
pub fn test_cipher() -> Cipher {
    Cipher::new(&[42u8; 32]).unwrap()
}

/// Config whose ticker never interferes with a test's own timing.
pub fn quiet_config() -> WalConfig {
    init_tracing();
    WalConfig {
        buffer_capacity: 1024 * 1024,
        sync_interval: Duration::from_secs(3600),
        rotation_threshold: 0,
        rotation_interval: None,
        retention_max_count: 0,
        retention_max_age_days: 0,
    }
}

/// Opens a WAL in `dir` with a no-op rotation observer.
pub fn open_wal(dir: &Path, config: WalConfig) -> Wal {
    Wal::open(dir, config, Box::new(NoopRotateObserver)).unwrap()
}

/// Seals a put record for the test cipher.
pub fn sealed_put(cipher: &Cipher, key: &[u8], value: &[u8]) -> SealedRecord {
    cipher
        .seal(&Record::new_put(key.to_vec(), value.to_vec(), NO_EXPIRY))
        .unwrap()
}

/// Seals a tombstone for the test cipher.
pub fn sealed_tombstone(cipher: &Cipher, key: &[u8]) -> SealedRecord {
    cipher.seal(&Record::new_tombstone(key.to_vec())).unwrap()
}

/// Replays the active WAL, panicking on any corrupt frame.
pub fn replay_all(wal: &Wal, cipher: &Cipher) -> Vec<Record> {
    wal.replay(cipher)
        .unwrap()
        .map(|item| item.expect("unexpected corrupt frame"))
        .collect()
}
