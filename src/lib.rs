//! # VelocityDB
//!
//! An embeddable, persistent, **encrypted** key-value storage engine
//! built on a **Log-Structured Merge Tree (LSM-tree)** architecture.
//! Every stored value is sealed at rest with an AEAD whose tag binds the
//! record's own metadata, so tampering with keys, timestamps, expiry, or
//! tombstone flags is detected on read.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                           Db                               │
//! │  ┌───────────┐  ┌────────────┐  ┌───────────────────────┐  │
//! │  │  Active    │  │  Frozen     │  │  Segments             │  │
//! │  │  memtable  │  │  memtables  │  │  L0 → L1 … Lmax       │  │
//! │  │  + WAL     │  │  + WALs     │  │  (encrypted on disk)  │  │
//! │  └────┬──────┘  └─────┬──────┘  └──────────┬────────────┘  │
//! │       │  seal          │  flush             │  compaction   │
//! │       └──────────►     └─────────►          │               │
//! │                                             │               │
//! │  ┌──────────────────────────────────────────┘               │
//! │  │  Catalog (event log + snapshot)                          │
//! │  └──────────────────────────────────────────────────────────│
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Facade — open, read, write, TTL, counters, batches, enumeration |
//! | [`memtable`] | Concurrent ordered in-memory write buffer |
//! | [`wal`] | Buffered, rotating, encrypted write-ahead log |
//! | [`sstable`] | Immutable block-structured segments with bloom filters |
//! | [`catalog`] | Persistent level catalog (event log + snapshot) |
//! | [`compaction`] | Leveled compaction with tombstone and TTL GC |
//! | [`crypto`] | AEAD cipher, master-key lifecycle, secret sharing |
//! | [`cache`] | Byte-bounded LRU over hot decoded values |
//! | [`record`] | Record model and wire framing |
//! | [`encoding`] | Deterministic little-endian wire format |
//!
//! ## Key features
//!
//! - **Encryption at rest** — XChaCha20-Poly1305 per record, metadata
//!   bound as associated data, CRC32 over the plaintext.
//! - **Write-ahead logging** — buffered appends with background flush,
//!   fsync on policy, size/age rotation into an archive, replay on open.
//! - **Newest-wins visibility** — layer rank first, then timestamp;
//!   tombstones shadow until last-level compaction drops them.
//! - **TTL expiry** — expired records turn invisible immediately and are
//!   reclaimed during compaction.
//! - **Master-key lifecycle** — env/file/interactive sources, optional
//!   Shamir share escrow, in-memory caching with TTL, rotation.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use velocitydb::{CancelToken, Db, DbConfig};
//!
//! let token = CancelToken::never();
//! let db = Db::open("/var/lib/vault", DbConfig::default()).unwrap();
//!
//! db.put(b"hello".to_vec(), b"world".to_vec(), &token).unwrap();
//! assert_eq!(
//!     db.get(b"hello", &token).unwrap(),
//!     Some(b"world".to_vec())
//! );
//!
//! db.delete(b"hello".to_vec(), &token).unwrap();
//! assert_eq!(db.get(b"hello", &token).unwrap(), None);
//!
//! db.close().unwrap();
//! ```

pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod clock;
pub mod compaction;
pub mod crypto;
pub mod db;
pub mod encoding;
pub mod memtable;
pub mod record;
pub mod sstable;
pub mod wal;

pub use cache::CacheMode;
pub use cancel::CancelToken;
pub use crypto::{KeySource, MasterKey};
pub use db::{Batch, Db, DbConfig, DbError, DbStats, KeysPage, WriteListener};
