//! Threshold secret sharing tests.

use crate::crypto::shamir::{Share, ShamirError, combine, split};

const SECRET: &[u8] = &[
    0x00, 0x01, 0x7F, 0x80, 0xFF, 0xAA, 0x55, 0x13, 0x37, 0xDE, 0xAD, 0xBE, 0xEF, 0x42, 0x99,
    0x21, 0x00, 0x01, 0x7F, 0x80, 0xFF, 0xAA, 0x55, 0x13, 0x37, 0xDE, 0xAD, 0xBE, 0xEF, 0x42,
    0x99, 0x21,
];

#[test]
fn threshold_of_shares_reconstructs() {
    let shares = split(SECRET, 3, 5).unwrap();
    assert_eq!(shares.len(), 5);

    let recovered = combine(&shares[..3], 3).unwrap();
    assert_eq!(recovered, SECRET);
}

#[test]
fn any_subset_of_threshold_size_works() {
    let shares = split(SECRET, 2, 4).unwrap();

    for i in 0..4 {
        for j in (i + 1)..4 {
            let subset = [shares[i].clone(), shares[j].clone()];
            assert_eq!(combine(&subset, 2).unwrap(), SECRET, "subset ({i},{j})");
        }
    }
}

#[test]
fn extra_shares_are_ignored() {
    let shares = split(SECRET, 3, 6).unwrap();
    assert_eq!(combine(&shares, 3).unwrap(), SECRET);
}

#[test]
fn below_threshold_fails() {
    let shares = split(SECRET, 3, 5).unwrap();
    let err = combine(&shares[..2], 3).unwrap_err();
    assert!(matches!(
        err,
        ShamirError::InsufficientShares { have: 2, need: 3 }
    ));
}

#[test]
fn below_threshold_reveals_nothing_like_the_secret() {
    // Sanity check, not a proof: a single share's bytes should not
    // equal the secret.
    let shares = split(SECRET, 2, 3).unwrap();
    for share in &shares {
        assert_ne!(share.data, SECRET);
    }
}

#[test]
fn invalid_parameters_are_rejected() {
    assert!(matches!(
        split(SECRET, 1, 5),
        Err(ShamirError::InvalidParameters { .. })
    ));
    assert!(matches!(
        split(SECRET, 6, 5),
        Err(ShamirError::InvalidParameters { .. })
    ));
    assert!(matches!(split(&[], 2, 3), Err(ShamirError::EmptySecret)));
}

#[test]
fn duplicate_share_indices_are_rejected() {
    let shares = split(SECRET, 2, 3).unwrap();
    let dupes = [shares[0].clone(), shares[0].clone()];
    assert!(matches!(
        combine(&dupes, 2),
        Err(ShamirError::DuplicateIndex(_))
    ));
}

#[test]
fn mismatched_share_lengths_are_rejected() {
    let shares = split(SECRET, 2, 3).unwrap();
    let broken = [
        shares[0].clone(),
        Share {
            index: shares[1].index,
            data: shares[1].data[..10].to_vec(),
        },
    ];
    assert!(matches!(combine(&broken, 2), Err(ShamirError::LengthMismatch)));
}

#[test]
fn split_is_randomized() {
    let a = split(SECRET, 3, 5).unwrap();
    let b = split(SECRET, 3, 5).unwrap();
    // Same secret, fresh polynomials: share payloads differ.
    assert_ne!(a[0].data, b[0].data);
}
