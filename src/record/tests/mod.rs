//! Tests for the record model: checksums, expiry, framing, pooling.

use crate::encoding::{self, Decode, Encode};
use crate::record::*;

#[test]
fn put_records_carry_checksum_over_key_and_value() {
    let record = Record::new_put(b"user:1".to_vec(), b"alice".to_vec(), NO_EXPIRY);
    assert!(!record.deleted);
    assert!(record.verify_checksum());
    assert_eq!(record.crc32, checksum(b"user:1", b"alice", false));
}

#[test]
fn tombstone_checksum_covers_key_only() {
    let record = Record::new_tombstone(b"user:1".to_vec());
    assert!(record.deleted);
    assert!(record.value.is_empty());
    assert_eq!(record.crc32, checksum(b"user:1", b"", true));
    // A tombstone's checksum must not depend on any value bytes.
    assert_eq!(record.crc32, checksum(b"user:1", b"ignored", true));
}

#[test]
fn tampered_value_fails_checksum() {
    let mut record = Record::new_put(b"k".to_vec(), b"value".to_vec(), NO_EXPIRY);
    assert!(record.verify_checksum());
    record.value[0] ^= 0x01;
    assert!(!record.verify_checksum());
}

#[test]
fn timestamps_strictly_increase_between_records() {
    let a = Record::new_put(b"a".to_vec(), b"1".to_vec(), NO_EXPIRY);
    let b = Record::new_put(b"a".to_vec(), b"2".to_vec(), NO_EXPIRY);
    assert!(b.timestamp > a.timestamp);
}

#[test]
fn expiry_semantics() {
    let now = crate::clock::now_nanos();
    let live = Record::new_put(b"k".to_vec(), b"v".to_vec(), now + 1_000_000_000);
    let dead = Record::new_put(b"k".to_vec(), b"v".to_vec(), now.saturating_sub(1));
    let forever = Record::new_put(b"k".to_vec(), b"v".to_vec(), NO_EXPIRY);

    assert!(!live.is_expired(now));
    assert!(dead.is_expired(now));
    assert!(!forever.is_expired(u64::MAX));
}

#[test]
fn sealed_record_frame_layout() {
    let sealed = SealedRecord {
        key: b"kk".to_vec(),
        nonce: vec![0xAB; 24],
        ciphertext: vec![0xCD; 5],
        timestamp: 0x0102030405060708,
        expires_at: 0,
        deleted: false,
        crc32: 0xFEEDFACE,
    };

    let bytes = encoding::encode_to_vec(&sealed).unwrap();
    assert_eq!(bytes.len(), sealed.frame_len());

    // u32 key_len | key
    assert_eq!(&bytes[..4], &2u32.to_le_bytes());
    assert_eq!(&bytes[4..6], b"kk");
    // u16 nonce_len | nonce
    assert_eq!(&bytes[6..8], &24u16.to_le_bytes());
    assert_eq!(&bytes[8..32], &[0xAB; 24]);
    // u32 ct_len | ciphertext
    assert_eq!(&bytes[32..36], &5u32.to_le_bytes());
    assert_eq!(&bytes[36..41], &[0xCD; 5]);
    // u64 timestamp | u64 expires_at | u8 deleted | u32 crc
    assert_eq!(&bytes[41..49], &0x0102030405060708u64.to_le_bytes());
    assert_eq!(&bytes[49..57], &0u64.to_le_bytes());
    assert_eq!(bytes[57], 0);
    assert_eq!(&bytes[58..62], &0xFEEDFACEu32.to_le_bytes());
}

#[test]
fn sealed_record_round_trips() {
    let sealed = SealedRecord {
        key: b"some-key".to_vec(),
        nonce: (0..24).collect(),
        ciphertext: vec![9; 128],
        timestamp: 42,
        expires_at: 99,
        deleted: true,
        crc32: 7,
    };
    let bytes = encoding::encode_to_vec(&sealed).unwrap();
    let (decoded, consumed) = SealedRecord::decode_from(&bytes).unwrap();
    assert_eq!(decoded, sealed);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn consecutive_frames_decode_independently() {
    let first = SealedRecord {
        key: b"a".to_vec(),
        nonce: vec![1; 24],
        ciphertext: vec![2; 3],
        timestamp: 1,
        expires_at: 0,
        deleted: false,
        crc32: 1,
    };
    let second = SealedRecord {
        key: b"b".to_vec(),
        nonce: vec![3; 24],
        ciphertext: Vec::new(),
        timestamp: 2,
        expires_at: 0,
        deleted: true,
        crc32: 2,
    };

    let mut buf = Vec::new();
    first.encode_to(&mut buf).unwrap();
    second.encode_to(&mut buf).unwrap();

    let (d1, n1) = SealedRecord::decode_from(&buf).unwrap();
    let (d2, n2) = SealedRecord::decode_from(&buf[n1..]).unwrap();
    assert_eq!(d1, first);
    assert_eq!(d2, second);
    assert_eq!(n1 + n2, buf.len());
}

#[test]
fn buffer_pool_recycles_cleared_buffers() {
    let pool = BufferPool::with_limits(2, 1024);

    let mut a = pool.acquire();
    a.extend_from_slice(b"scratch");
    pool.release(a);

    let b = pool.acquire();
    assert!(b.is_empty(), "recycled buffer must come back cleared");
}

#[test]
fn buffer_pool_drops_oversized_buffers() {
    let pool = BufferPool::with_limits(4, 16);
    let big = Vec::with_capacity(1024);
    pool.release(big);

    // The oversized buffer was not retained; a fresh one has no capacity.
    let next = pool.acquire();
    assert!(next.capacity() < 1024);
}

#[test]
fn buffer_pool_respects_slot_limit() {
    let pool = BufferPool::with_limits(1, 1024);
    pool.release(Vec::with_capacity(8));
    pool.release(Vec::with_capacity(8));
    // Only one slot retained; both acquires must still work.
    let _ = pool.acquire();
    let _ = pool.acquire();
}
