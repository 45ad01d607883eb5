//! Threshold secret sharing over GF(256).
//!
//! Splits a secret into `n` shares such that any `k` of them reconstruct
//! it while fewer than `k` reveal nothing. Each byte of the secret is the
//! constant term of an independent random polynomial of degree `k - 1`;
//! share `i` is the polynomial evaluated at `x = i` (so `x = 0` is never
//! a share). Reconstruction is Lagrange interpolation at `x = 0`.
//!
//! Field arithmetic uses the AES polynomial `x^8 + x^4 + x^3 + x + 1`
//! (0x11B) with carry-less peasant multiplication; inversion is
//! exponentiation to 254 (Fermat).

use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

/// Errors returned by split/combine.
#[derive(Debug, Error)]
pub enum ShamirError {
    /// Threshold or share count outside `1 < k <= n <= 255`.
    #[error("invalid share parameters: threshold {threshold}, shares {shares}")]
    InvalidParameters {
        /// Requested threshold (k).
        threshold: u8,
        /// Requested share count (n).
        shares: u8,
    },

    /// Fewer valid shares than the threshold requires.
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares {
        /// Shares available.
        have: usize,
        /// Threshold required.
        need: usize,
    },

    /// Two shares carried the same index.
    #[error("duplicate share index {0}")]
    DuplicateIndex(u8),

    /// Shares had differing payload lengths.
    #[error("share length mismatch")]
    LengthMismatch,

    /// The secret was empty.
    #[error("empty secret")]
    EmptySecret,
}

/// A single secret share: evaluation point and per-byte evaluations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point `x` (1-based, never 0).
    pub index: u8,

    /// One evaluation byte per secret byte.
    pub data: Vec<u8>,
}

/// Splits `secret` into `n` shares with reconstruction threshold `k`.
pub fn split(secret: &[u8], k: u8, n: u8) -> Result<Vec<Share>, ShamirError> {
    if secret.is_empty() {
        return Err(ShamirError::EmptySecret);
    }
    if k < 2 || k > n {
        return Err(ShamirError::InvalidParameters {
            threshold: k,
            shares: n,
        });
    }

    let mut shares: Vec<Share> = (1..=n)
        .map(|index| Share {
            index,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coeffs = vec![0u8; k as usize];
    for &byte in secret {
        // Degree k-1 polynomial with the secret byte as constant term.
        coeffs[0] = byte;
        OsRng.fill_bytes(&mut coeffs[1..]);
        // A zero leading coefficient would silently lower the threshold.
        while coeffs[k as usize - 1] == 0 {
            let mut top = [0u8; 1];
            OsRng.fill_bytes(&mut top);
            coeffs[k as usize - 1] = top[0];
        }

        for share in shares.iter_mut() {
            share.data.push(eval_poly(&coeffs, share.index));
        }
    }

    Ok(shares)
}

/// Reconstructs the secret from at least `k` distinct shares.
///
/// Extra shares beyond the threshold are ignored.
pub fn combine(shares: &[Share], k: usize) -> Result<Vec<u8>, ShamirError> {
    if shares.len() < k || k < 2 {
        return Err(ShamirError::InsufficientShares {
            have: shares.len(),
            need: k,
        });
    }

    let selected = &shares[..k];
    let secret_len = selected[0].data.len();
    for (i, share) in selected.iter().enumerate() {
        if share.data.len() != secret_len {
            return Err(ShamirError::LengthMismatch);
        }
        for other in &selected[..i] {
            if other.index == share.index {
                return Err(ShamirError::DuplicateIndex(share.index));
            }
        }
    }

    let mut secret = Vec::with_capacity(secret_len);
    for byte_idx in 0..secret_len {
        let mut acc = 0u8;
        for (j, share) in selected.iter().enumerate() {
            // Lagrange basis polynomial evaluated at x = 0.
            let mut num = 1u8;
            let mut den = 1u8;
            for (m, other) in selected.iter().enumerate() {
                if m == j {
                    continue;
                }
                num = gf_mul(num, other.index);
                den = gf_mul(den, other.index ^ share.index);
            }
            let basis = gf_mul(num, gf_inv(den));
            acc ^= gf_mul(share.data[byte_idx], basis);
        }
        secret.push(acc);
    }

    Ok(secret)
}

/// Evaluates the polynomial (Horner form) at `x`.
fn eval_poly(coeffs: &[u8], x: u8) -> u8 {
    let mut acc = 0u8;
    for &coeff in coeffs.iter().rev() {
        acc = gf_mul(acc, x) ^ coeff;
    }
    acc
}

/// Carry-less multiplication modulo the AES polynomial.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1B;
        }
        b >>= 1;
    }
    product
}

/// Multiplicative inverse via a^254 (a^255 = 1 for a != 0).
fn gf_inv(a: u8) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}
