//! Range and full scans over segments.

use tempfile::TempDir;

use crate::sstable::Segment;

use super::helpers::*;

fn scan_keys(segment: &Segment, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
    segment
        .scan_sealed(start, end)
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect()
}

#[test]
fn full_iteration_is_key_ordered_and_complete() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..300u32)
        .map(|i| (format!("it_{i:04}").into_bytes(), b"v".to_vec()))
        .collect();
    let borrowed: Vec<(&[u8], &[u8])> = entries
        .iter()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
        .collect();
    let path = build_segment_with_block_size(tmp.path(), 0, &cipher, &borrowed, 128);
    let segment = Segment::open(path).unwrap();

    let keys: Vec<Vec<u8>> = segment
        .iter_sealed()
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(keys.len(), 300);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys.first().map(Vec::as_slice), Some(&b"it_0000"[..]));
    assert_eq!(keys.last().map(Vec::as_slice), Some(&b"it_0299"[..]));
}

#[test]
fn range_scan_is_half_open() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let segment = open_segment(
        tmp.path(),
        &cipher,
        &[
            (b"a", b"1"),
            (b"b", b"2"),
            (b"c", b"3"),
            (b"d", b"4"),
            (b"e", b"5"),
        ],
    );

    assert_eq!(
        scan_keys(&segment, b"b", b"d"),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
}

#[test]
fn range_scan_clips_to_segment_bounds() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let segment = open_segment(tmp.path(), &cipher, &[(b"m", b"1"), (b"n", b"2")]);

    // Bounds wider than the segment on both sides.
    assert_eq!(
        scan_keys(&segment, b"a", b"z"),
        vec![b"m".to_vec(), b"n".to_vec()]
    );
    // Entirely before and entirely after.
    assert!(scan_keys(&segment, b"a", b"c").is_empty());
    assert!(scan_keys(&segment, b"x", b"z").is_empty());
}

#[test]
fn range_scan_starts_mid_block_and_crosses_blocks() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100u32)
        .map(|i| (format!("x_{i:03}").into_bytes(), vec![0u8; 40]))
        .collect();
    let borrowed: Vec<(&[u8], &[u8])> = entries
        .iter()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
        .collect();
    let path = build_segment_with_block_size(tmp.path(), 0, &cipher, &borrowed, 200);
    let segment = Segment::open(path).unwrap();

    let keys = scan_keys(&segment, b"x_025", b"x_075");
    assert_eq!(keys.len(), 50);
    assert_eq!(keys.first().map(Vec::as_slice), Some(&b"x_025"[..]));
    assert_eq!(keys.last().map(Vec::as_slice), Some(&b"x_074"[..]));
}

#[test]
fn scanned_records_decrypt_to_original_values() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let segment = open_segment(
        tmp.path(),
        &cipher,
        &[(b"k1", b"value-one"), (b"k2", b"value-two")],
    );

    let values: Vec<Vec<u8>> = segment
        .iter_sealed()
        .unwrap()
        .map(|r| cipher.open(&r.unwrap()).unwrap().value)
        .collect();
    assert_eq!(values, vec![b"value-one".to_vec(), b"value-two".to_vec()]);
}
