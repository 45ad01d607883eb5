//! Crash recovery: WAL replay, catalog adoption, partial-file cleanup.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::db::Db;

use super::helpers::*;

#[test]
fn synced_writes_survive_a_crash() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        db.put(b"a".to_vec(), b"1".to_vec(), &t).unwrap();
        db.put(b"b".to_vec(), b"2".to_vec(), &t).unwrap();
        db.delete(b"a".to_vec(), &t).unwrap();
        simulate_crash(db);
    }

    let db = open_db(tmp.path());
    assert_eq!(db.get(b"a", &t).unwrap(), None);
    assert_eq!(db.get(b"b", &t).unwrap(), Some(b"2".to_vec()));
}

#[test]
fn overwrites_replay_to_the_latest_value() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        for i in 0..10u32 {
            db.put(b"k".to_vec(), format!("v{i}").into_bytes(), &t)
                .unwrap();
        }
        simulate_crash(db);
    }

    let db = open_db(tmp.path());
    assert_eq!(db.get(b"k", &t).unwrap(), Some(b"v9".to_vec()));
}

#[test]
fn graceful_close_then_reopen_serves_from_segments() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        fill_keys(&db, "closed", 40);
        db.close().unwrap();
    }

    let db = open_db(tmp.path());
    let stats = db.stats().unwrap();
    assert!(stats.level_segment_counts.iter().sum::<usize>() > 0);
    for i in 0..40usize {
        let key = format!("closed_{i:05}").into_bytes();
        assert_eq!(db.get(&key, &t).unwrap(), Some(expected_value("closed", i)));
    }
}

#[test]
fn mixed_wal_and_segment_state_recovers() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        fill_keys(&db, "old", 20);
        db.flush(&t).unwrap(); // durable in L0
        fill_keys(&db, "new", 20); // only in WAL + memtable
        simulate_crash(db);
    }

    let db = open_db(tmp.path());
    for i in 0..20usize {
        let old_key = format!("old_{i:05}").into_bytes();
        let new_key = format!("new_{i:05}").into_bytes();
        assert_eq!(db.get(&old_key, &t).unwrap(), Some(expected_value("old", i)));
        assert_eq!(db.get(&new_key, &t).unwrap(), Some(expected_value("new", i)));
    }
}

#[test]
fn ttl_state_survives_recovery() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        db.put_with_ttl(
            b"temp".to_vec(),
            b"x".to_vec(),
            std::time::Duration::from_millis(80),
            &t,
        )
        .unwrap();
        db.put(b"stable".to_vec(), b"y".to_vec(), &t).unwrap();
        simulate_crash(db);
    }

    std::thread::sleep(std::time::Duration::from_millis(150));
    let db = open_db(tmp.path());
    assert_eq!(db.get(b"temp", &t).unwrap(), None, "expiry enforced after replay");
    assert_eq!(db.get(b"stable", &t).unwrap(), Some(b"y".to_vec()));
}

#[test]
fn corrupt_wal_tail_recovers_the_valid_prefix() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        db.put(b"safe".to_vec(), b"prefix".to_vec(), &t).unwrap();
        db.put(b"torn".to_vec(), b"tail".to_vec(), &t).unwrap();
        simulate_crash(db);
    }

    // Flip a byte in the last frame's ciphertext region.
    let wal_path = tmp.path().join("wal.log");
    let len = std::fs::metadata(&wal_path).unwrap().len();
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&wal_path)
        .unwrap();
    let offset = len - 20;
    f.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    f.read_exact(&mut byte).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&[!byte[0]]).unwrap();
    f.sync_all().unwrap();

    let db = open_db(tmp.path());
    assert_eq!(db.get(b"safe", &t).unwrap(), Some(b"prefix".to_vec()));
    assert_eq!(db.get(b"torn", &t).unwrap(), None, "corrupt frame dropped");
}

#[test]
fn stray_tmp_files_are_swept_on_open() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("sst_L0_123.tmp"), b"partial").unwrap();
    std::fs::write(tmp.path().join("sst_L0_123.spill"), b"partial").unwrap();

    let db = open_db(tmp.path());
    drop(db);
    assert!(!tmp.path().join("sst_L0_123.tmp").exists());
    assert!(!tmp.path().join("sst_L0_123.spill").exists());
}

#[test]
fn footerless_segment_files_are_deleted_on_open() {
    let tmp = TempDir::new().unwrap();
    // A plausible name with garbage content: no valid footer.
    std::fs::write(tmp.path().join("sst_L0_999.db"), vec![0xAB; 256]).unwrap();

    let db = open_db(tmp.path());
    drop(db);
    assert!(!tmp.path().join("sst_L0_999.db").exists());
}

#[test]
fn uncatalogued_segment_is_adopted_by_filename() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        fill_keys(&db, "adopt", 10);
        db.close().unwrap();
    }

    // Lose the catalog: both the snapshot and the event log.
    std::fs::remove_file(tmp.path().join(crate::catalog::SNAPSHOT_FILE)).unwrap();
    let _ = std::fs::remove_file(tmp.path().join(crate::catalog::LOG_FILE));

    let db = open_db(tmp.path());
    for i in 0..10usize {
        let key = format!("adopt_{i:05}").into_bytes();
        assert_eq!(db.get(&key, &t).unwrap(), Some(expected_value("adopt", i)));
    }
}

#[test]
fn repeated_crash_recover_cycles_accumulate_no_damage() {
    let tmp = TempDir::new().unwrap();
    let t = token();

    for round in 0..3u32 {
        let db = open_db(tmp.path());
        db.put(
            format!("round_{round}").into_bytes(),
            b"v".to_vec(),
            &t,
        )
        .unwrap();
        simulate_crash(db);
    }

    let db = open_db(tmp.path());
    for round in 0..3u32 {
        let key = format!("round_{round}").into_bytes();
        assert_eq!(db.get(&key, &t).unwrap(), Some(b"v".to_vec()), "round {round}");
    }
}

#[test]
fn wrong_key_on_reopen_cannot_read_segments() {
    let tmp = TempDir::new().unwrap();
    let t = token();
    {
        let db = open_db(tmp.path());
        db.put(b"secret".to_vec(), b"payload".to_vec(), &t).unwrap();
        db.close().unwrap(); // data lands in a segment
    }

    let config = crate::db::DbConfig {
        key_source: crate::crypto::KeySource::Explicit(other_key()),
        ..test_config()
    };
    let db = Db::open(tmp.path(), config).unwrap();
    assert!(db.get(b"secret", &t).is_err(), "wrong key must not decrypt");
}
