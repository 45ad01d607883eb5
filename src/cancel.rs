//! Cooperative cancellation for long-running operations and owned workers.
//!
//! Every long operation on the database facade accepts a [`CancelToken`];
//! background workers (WAL ticker, memtable flusher, compactor) hold a
//! clone of the engine's shutdown token. Cancellation is cooperative:
//! operations poll [`CancelToken::check`] at loop boundaries, so a
//! cancelled operation never leaves partially visible durable state
//! (record frames are written atomically).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Error returned by [`CancelToken::check`] once the token has fired.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

/// A cloneable cancellation token shared between callers and workers.
///
/// Cloning is cheap; all clones observe the same state. Once cancelled, a
/// token never resets.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a fresh, un-fired token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    /// A token that is never cancelled. Convenience for callers without a
    /// cancellation context.
    pub fn never() -> Self {
        Self::new()
    }

    /// Fires the token and wakes any worker sleeping in [`Self::wait_timeout`].
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.cv.notify_all();
    }

    /// Returns `true` once [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`, returning early (with `true`) when the
    /// token fires. Workers use this as an interruptible tick.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = match self.inner.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the lock so a cancel between the first check and
        // the wait cannot be missed.
        if self.is_cancelled() {
            return true;
        }
        let _ = self.inner.cv.wait_timeout(guard, timeout);
        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
