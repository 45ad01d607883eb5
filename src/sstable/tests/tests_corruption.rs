//! Corruption detection, quarantine, and repair.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::TempDir;

use crate::sstable::repair::repair_segment;
use crate::sstable::{SST_FOOTER_SIZE, Segment, SstError};

use super::helpers::*;

fn flip_at(path: &Path, offset: u64) {
    let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    f.read_exact(&mut byte).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&[!byte[0]]).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn corrupt_footer_magic_refuses_to_open() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let path = build_segment(tmp.path(), 0, &cipher, &[(b"k", b"v")]);

    let len = std::fs::metadata(&path).unwrap().len();
    flip_at(&path, len - 1); // inside the trailing magic

    assert!(matches!(Segment::open(&path), Err(SstError::Corrupt(_))));
}

#[test]
fn truncated_file_refuses_to_open() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let path = build_segment(tmp.path(), 0, &cipher, &[(b"k", b"v")]);

    let f = OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(SST_FOOTER_SIZE as u64 - 1).unwrap();
    f.sync_all().unwrap();

    assert!(Segment::open(&path).is_err());
}

#[test]
fn corrupt_header_magic_refuses_to_open() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let path = build_segment(tmp.path(), 0, &cipher, &[(b"k", b"v")]);

    flip_at(&path, 0);
    assert!(matches!(Segment::open(&path), Err(SstError::Corrupt(_))));
}

#[test]
fn tampered_value_fails_get_with_auth_error() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let path = build_segment(tmp.path(), 0, &cipher, &[(b"key", b"stored-value")]);
    let segment = Segment::open(&path).unwrap();

    // First data byte sits right after the header; the header is
    // magic(4) + version(4) + count(4) + min/max key byte strings.
    let header_len = (4 + 4 + 4 + (4 + 3) + (4 + 3)) as u64;
    // Skip the frame's key prefix and nonce to land inside ciphertext.
    let ct_offset = header_len + 4 + 3 + 2 + 24 + 4;
    drop(segment);
    flip_at(&path, ct_offset);

    let segment = Segment::open(&path).unwrap();
    let err = segment.get(b"key", &cipher).unwrap_err();
    assert!(matches!(err, SstError::Cipher(_)));
}

#[test]
fn structural_damage_quarantines_the_segment() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let path = build_segment(tmp.path(), 0, &cipher, &[(b"key", b"value")]);

    // Blow up the frame's length prefix inside the data block.
    let header_len = (4 + 4 + 4 + (4 + 3) + (4 + 3)) as u64;
    let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(header_len)).unwrap();
    f.write_all(&u32::MAX.to_le_bytes()).unwrap();
    f.sync_all().unwrap();

    let segment = Segment::open(&path).unwrap();
    assert!(!segment.is_read_broken());
    assert!(segment.get(b"key", &cipher).is_err());
    assert!(segment.is_read_broken());

    // Quarantined: even a key the bloom rejects now fails fast.
    assert!(matches!(
        segment.get_sealed(b"key"),
        Err(SstError::Corrupt(_))
    ));
}

#[test]
fn repair_salvages_the_valid_prefix() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200u32)
        .map(|i| (format!("rep_{i:04}").into_bytes(), vec![0x5A; 32]))
        .collect();
    let borrowed: Vec<(&[u8], &[u8])> = entries
        .iter()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
        .collect();
    let path = build_segment_with_block_size(tmp.path(), 2, &cipher, &borrowed, 512);
    let segment = Segment::open(&path).unwrap();

    // Corrupt a ciphertext byte roughly two thirds in.
    let file_len = std::fs::metadata(&path).unwrap().len();
    drop(segment);
    flip_at(&path, file_len * 2 / 3);

    let damaged = Segment::open(&path).unwrap();
    let report = repair_segment(&damaged, tmp.path(), &cipher, 512, 10).unwrap();

    assert!(report.recovered > 0);
    assert!(report.lost > 0);
    assert_eq!(report.recovered + report.lost, 200);

    let new_path = report.new_path.unwrap();
    let repaired = Segment::open(&new_path).unwrap();
    assert_eq!(repaired.level, 2, "repair keeps the level");
    assert_eq!(u64::from(repaired.entry_count()), report.recovered);

    // Every salvaged record decrypts and matches the original value.
    for item in repaired.iter_sealed().unwrap() {
        let record = cipher.open(&item.unwrap()).unwrap();
        assert_eq!(record.value, vec![0x5A; 32]);
    }
}

#[test]
fn repair_of_fully_corrupt_data_recovers_nothing() {
    let tmp = TempDir::new().unwrap();
    let cipher = test_cipher();
    let path = build_segment(tmp.path(), 0, &cipher, &[(b"k", b"v")]);

    // Corrupt the very first ciphertext byte: nothing validates.
    let header_len = (4 + 4 + 4 + (4 + 1) + (4 + 1)) as u64;
    let ct_offset = header_len + 4 + 1 + 2 + 24 + 4;
    flip_at(&path, ct_offset);

    let damaged = Segment::open(&path).unwrap();
    let report = repair_segment(&damaged, tmp.path(), &cipher, 4096, 10).unwrap();
    assert!(report.new_path.is_none());
    assert_eq!(report.recovered, 0);
}
