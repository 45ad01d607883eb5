//! Cryptographic subsystem: AEAD record sealing, master-key lifecycle,
//! and threshold secret sharing.
//!
//! | Sub-module | Purpose |
//! |------------|---------|
//! | [`cipher`] | XChaCha20-Poly1305 wrapper binding record metadata as AAD |
//! | [`masterkey`] | Acquire / cache / rotate the 32-byte root key |
//! | [`shamir`] | (t, n) secret sharing over GF(256) for key escrow |
//!
//! Keys are zeroized on drop. The cipher is the only component that ever
//! touches plaintext values; everything downstream of it (WAL, SSTables,
//! compaction) operates on sealed records.

pub mod cipher;
pub mod masterkey;
pub mod shamir;

#[cfg(test)]
mod tests;

pub use cipher::{Cipher, CipherError, KEY_LEN, NONCE_LEN};
pub use masterkey::{KeyError, KeySource, MasterKey, MasterKeyManager};
