//! Key enumeration and pagination.

use tempfile::TempDir;

use super::helpers::*;

#[test]
fn keys_with_prefix_pattern() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    db.put(b"a:1".to_vec(), b"v".to_vec(), &t).unwrap();
    db.put(b"a:2".to_vec(), b"v".to_vec(), &t).unwrap();
    db.put(b"b:1".to_vec(), b"v".to_vec(), &t).unwrap();

    let keys = db.keys("a:*", &t).unwrap();
    assert_eq!(keys, vec![b"a:1".to_vec(), b"a:2".to_vec()]);
}

#[test]
fn keys_star_matches_everything_sorted() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    for key in [&b"delta"[..], b"alpha", b"charlie", b"bravo"] {
        db.put(key.to_vec(), b"v".to_vec(), &t).unwrap();
    }

    let keys = db.keys("*", &t).unwrap();
    assert_eq!(
        keys,
        vec![
            b"alpha".to_vec(),
            b"bravo".to_vec(),
            b"charlie".to_vec(),
            b"delta".to_vec()
        ]
    );
}

#[test]
fn deleted_keys_are_excluded() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    db.put(b"keep".to_vec(), b"v".to_vec(), &t).unwrap();
    db.put(b"drop".to_vec(), b"v".to_vec(), &t).unwrap();
    db.delete(b"drop".to_vec(), &t).unwrap();

    assert_eq!(db.keys("*", &t).unwrap(), vec![b"keep".to_vec()]);
}

#[test]
fn tombstone_in_memtable_hides_flushed_key() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    db.put(b"layered".to_vec(), b"v".to_vec(), &t).unwrap();
    db.flush(&t).unwrap();
    db.delete(b"layered".to_vec(), &t).unwrap();

    // The newest verdict (the memtable tombstone) wins over the
    // level-0 copy.
    assert!(db.keys("*", &t).unwrap().is_empty());
}

#[test]
fn enumeration_merges_all_layers_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    fill_keys(&db, "merge", 30);
    db.flush(&t).unwrap();
    // Overwrite a third of them so memtable and L0 both hold the keys.
    for i in 0..10usize {
        let key = format!("merge_{i:05}").into_bytes();
        db.put(key, b"newer".to_vec(), &t).unwrap();
    }

    let keys = db.keys("merge_*", &t).unwrap();
    assert_eq!(keys.len(), 30, "each key appears exactly once");
}

#[test]
fn keys_page_returns_slice_and_total() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    for i in 0..16u32 {
        db.put(format!("page_{i:02}").into_bytes(), b"v".to_vec(), &t)
            .unwrap();
    }

    let page = db.keys_page(2, 3, &t).unwrap();
    assert_eq!(page.total, 16);
    assert_eq!(
        page.keys,
        vec![
            b"page_02".to_vec(),
            b"page_03".to_vec(),
            b"page_04".to_vec()
        ]
    );
}

#[test]
fn keys_page_past_the_end_is_empty_with_total() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    db.put(b"only".to_vec(), b"v".to_vec(), &t).unwrap();
    let page = db.keys_page(10, 5, &t).unwrap();
    assert!(page.keys.is_empty());
    assert_eq!(page.total, 1);
}

#[test]
fn colon_is_not_a_separator_for_matching() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path());
    let t = token();

    db.put(b"compliance:tag:1".to_vec(), b"v".to_vec(), &t)
        .unwrap();
    db.put(b"compliance:tag:1:sub".to_vec(), b"v".to_vec(), &t)
        .unwrap();

    // The wildcard crosses ':' freely.
    let keys = db.keys("compliance:tag:*", &t).unwrap();
    assert_eq!(keys.len(), 2);
}
