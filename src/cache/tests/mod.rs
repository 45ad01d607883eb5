//! Tests for the byte-bounded value cache.

use crate::cache::*;

#[test]
fn get_put_remove_round_trip() {
    let cache = ValueCache::new(1024);

    assert!(cache.get(b"k").is_none());
    cache.put(b"k", b"value");
    assert_eq!(cache.get(b"k").unwrap(), b"value");

    cache.remove(b"k");
    assert!(cache.get(b"k").is_none());
}

#[test]
fn returned_values_are_copies() {
    let cache = ValueCache::new(1024);
    cache.put(b"k", b"original");

    let mut copy = cache.get(b"k").unwrap();
    copy[0] = b'X';
    assert_eq!(cache.get(b"k").unwrap(), b"original");
}

#[test]
fn put_replaces_and_reaccounts_bytes() {
    let cache = ValueCache::new(1024);
    cache.put(b"k", &[0u8; 100]);
    assert_eq!(cache.total_bytes(), 101);

    cache.put(b"k", &[0u8; 10]);
    assert_eq!(cache.total_bytes(), 11);
    assert_eq!(cache.len(), 1);
}

#[test]
fn eviction_removes_least_recently_used_first() {
    // Capacity fits two 40-byte entries (41 bytes each with the key).
    let cache = ValueCache::new(100);
    cache.put(b"a", &[1u8; 40]);
    cache.put(b"b", &[2u8; 40]);

    // Touch "a" so "b" becomes the LRU tail.
    cache.get(b"a");
    cache.put(b"c", &[3u8; 40]);

    assert!(cache.get(b"a").is_some());
    assert!(cache.get(b"b").is_none(), "LRU tail evicted");
    assert!(cache.get(b"c").is_some());
    assert!(cache.total_bytes() <= 100);
}

#[test]
fn entries_larger_than_capacity_are_not_cached() {
    let cache = ValueCache::new(64);
    cache.put(b"huge", &[0u8; 1024]);
    assert!(cache.get(b"huge").is_none());
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn clear_drops_everything() {
    let cache = ValueCache::new(1024);
    cache.put(b"a", b"1");
    cache.put(b"b", b"2");
    cache.clear();

    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
    assert!(cache.get(b"a").is_none());
}

#[test]
fn adaptive_capacity_is_clamped() {
    let capacity = adaptive_capacity();
    assert!(capacity >= MIN_ADAPTIVE_CAPACITY);
    assert!(capacity <= MAX_ADAPTIVE_CAPACITY);
}

#[test]
fn cache_modes_resolve_to_sane_capacities() {
    assert_eq!(
        CacheMode::Aggressive.capacity_bytes(),
        MAX_ADAPTIVE_CAPACITY
    );
    assert_eq!(
        CacheMode::Performance.capacity_bytes(),
        MIN_ADAPTIVE_CAPACITY
    );
    let balanced = CacheMode::Balanced.capacity_bytes();
    assert!(balanced >= MIN_ADAPTIVE_CAPACITY && balanced <= MAX_ADAPTIVE_CAPACITY);
}

#[test]
fn heavy_churn_stays_within_capacity() {
    let cache = ValueCache::new(4096);
    for i in 0..1000u32 {
        let key = format!("churn_{i:04}").into_bytes();
        cache.put(&key, &[0xEE; 100]);
        assert!(cache.total_bytes() <= 4096);
    }
    assert!(cache.len() <= 4096 / 100);
}
