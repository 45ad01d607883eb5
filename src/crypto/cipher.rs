//! AEAD cipher — XChaCha20-Poly1305 with record metadata as associated data.
//!
//! Every stored value is sealed with a fresh random 24-byte nonce. The
//! associated data bound into the authentication tag is the deterministic
//! byte string
//!
//! ```text
//! LE32(len(key)) || key || LE64(timestamp) || LE64(expires_at) || byte(deleted)
//! ```
//!
//! so flipping any byte of the key, timestamps, expiry, or tombstone flag
//! of a stored record makes decryption fail closed. After a successful
//! decryption the plaintext CRC32 carried in the frame is re-verified,
//! catching corruption introduced before sealing.

use std::sync::RwLock;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

use crate::record::{Record, SealedRecord, checksum};

/// Master-key length in bytes.
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Errors returned by cipher operations.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The supplied key was not exactly [`KEY_LEN`] bytes.
    #[error("invalid key length {0} (expected {KEY_LEN})")]
    InvalidKeyLength(usize),

    /// A stored nonce had the wrong length.
    #[error("invalid nonce length {0} (expected {NONCE_LEN})")]
    InvalidNonceLength(usize),

    /// Encryption failed (should not happen with a valid key).
    #[error("encryption failure")]
    Encrypt,

    /// The ciphertext or its associated data failed authentication.
    #[error("payload failed authentication")]
    Authentication,

    /// Plaintext checksum mismatch after a successful decryption.
    #[error("record checksum mismatch after decryption")]
    ChecksumMismatch,

    /// Internal lock failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Record-sealing AEAD cipher.
///
/// The inner primitive sits behind an `RwLock` so
/// [`rotate`](Cipher::rotate) can swap the active key atomically while
/// readers keep decrypting with whichever key was active when they
/// acquired the lock. The engine uses a single active key; re-encrypting
/// historical data under a new key is a higher-layer workflow.
pub struct Cipher {
    aead: RwLock<XChaCha20Poly1305>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Builds a cipher from a 32-byte master key.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        let aead = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            aead: RwLock::new(aead),
        })
    }

    /// Replaces the active key. Existing ciphertext is untouched; records
    /// sealed under the previous key can no longer be opened through this
    /// cipher.
    pub fn rotate(&self, key: &[u8]) -> Result<(), CipherError> {
        if key.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        let aead = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        let mut guard = self
            .aead
            .write()
            .map_err(|_| CipherError::Internal("cipher lock poisoned".into()))?;
        *guard = aead;
        Ok(())
    }

    /// Seals a plaintext record: fresh nonce, value encrypted, metadata
    /// bound as AAD.
    pub fn seal(&self, record: &Record) -> Result<SealedRecord, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let aad = build_aad(
            &record.key,
            record.timestamp,
            record.expires_at,
            record.deleted,
        );

        let guard = self
            .aead
            .read()
            .map_err(|_| CipherError::Internal("cipher lock poisoned".into()))?;
        let ciphertext = guard
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &record.value,
                    aad: &aad,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;

        Ok(SealedRecord {
            key: record.key.clone(),
            nonce: nonce.to_vec(),
            ciphertext,
            timestamp: record.timestamp,
            expires_at: record.expires_at,
            deleted: record.deleted,
            crc32: record.crc32,
        })
    }

    /// Opens a sealed record, verifying the AEAD tag and then the
    /// plaintext checksum.
    pub fn open(&self, sealed: &SealedRecord) -> Result<Record, CipherError> {
        if sealed.nonce.len() != NONCE_LEN {
            return Err(CipherError::InvalidNonceLength(sealed.nonce.len()));
        }

        let aad = build_aad(
            &sealed.key,
            sealed.timestamp,
            sealed.expires_at,
            sealed.deleted,
        );

        let guard = self
            .aead
            .read()
            .map_err(|_| CipherError::Internal("cipher lock poisoned".into()))?;
        let value = guard
            .decrypt(
                XNonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CipherError::Authentication)?;
        drop(guard);

        if checksum(&sealed.key, &value, sealed.deleted) != sealed.crc32 {
            return Err(CipherError::ChecksumMismatch);
        }

        Ok(Record {
            key: sealed.key.clone(),
            value,
            timestamp: sealed.timestamp,
            expires_at: sealed.expires_at,
            deleted: sealed.deleted,
            crc32: sealed.crc32,
        })
    }
}

/// Builds the deterministic AAD byte string for a record's metadata.
fn build_aad(key: &[u8], timestamp: u64, expires_at: u64, deleted: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + key.len() + 8 + 8 + 1);
    aad.extend_from_slice(&(key.len() as u32).to_le_bytes());
    aad.extend_from_slice(key);
    aad.extend_from_slice(&timestamp.to_le_bytes());
    aad.extend_from_slice(&expires_at.to_le_bytes());
    aad.push(u8::from(deleted));
    aad
}
