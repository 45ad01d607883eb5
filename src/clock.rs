//! Monotonic-ish wall-clock timestamps.
//!
//! Record timestamps drive newest-wins visibility, so two writes on the
//! same key must never receive the same timestamp even when the wall clock
//! stalls or steps backwards. [`now_nanos`] therefore returns
//! `max(wall_clock, last_returned + 1)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicU64 = AtomicU64::new(0);

/// Returns a strictly increasing nanosecond timestamp anchored to the
/// UNIX-epoch wall clock.
pub fn now_nanos() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let mut prev = LAST.load(Ordering::SeqCst);
    loop {
        let next = wall.max(prev.saturating_add(1));
        match LAST.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let mut last = 0;
        for _ in 0..10_000 {
            let ts = now_nanos();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn concurrent_timestamps_are_unique() {
        use std::collections::HashSet;
        use std::sync::mpsc;
        use std::thread;

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    tx.send(now_nanos()).unwrap();
                }
            }));
        }
        drop(tx);
        let seen: Vec<u64> = rx.iter().collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let unique: HashSet<u64> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len());
    }
}
