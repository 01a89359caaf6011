// ABOUTME: Reference-counted wake-lock interface held by the delivery state machine while busy
// ABOUTME: Provides an atomic counting implementation for hosts without a platform wake-lock

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Reference-counted resource that keeps the system awake while held
///
/// Supplied by the host environment. Every `acquire` must be balanced by
/// one `release`; the lock is held while the count is above zero.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);

    fn release(&self);

    fn is_held(&self) -> bool;

    /// Release until the lock is no longer held, whatever the count
    fn release_all(&self) {
        while self.is_held() {
            self.release();
        }
    }
}

/// Wake-lock tracking its reference count in an atomic counter
#[derive(Debug)]
pub struct CountingWakeLock {
    name: String,
    count: AtomicUsize,
}

impl CountingWakeLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current reference count
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(wake_lock = %self.name, count, "acquired");
    }

    fn release(&self) {
        let result = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
        match result {
            Ok(previous) => debug!(wake_lock = %self.name, count = previous - 1, "released"),
            Err(_) => warn!(wake_lock = %self.name, "release on a lock that is not held"),
        }
    }

    fn is_held(&self) -> bool {
        self.count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counting() {
        let lock = CountingWakeLock::new("test");
        assert!(!lock.is_held());

        lock.acquire();
        lock.acquire();
        lock.release();
        assert!(lock.is_held());
        assert_eq!(lock.count(), 1);

        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_release_when_not_held_is_ignored() {
        let lock = CountingWakeLock::new("test");
        lock.release();
        assert_eq!(lock.count(), 0);
        lock.acquire();
        assert_eq!(lock.count(), 1);
    }

    #[test]
    fn test_release_all() {
        let lock = CountingWakeLock::new("test");
        for _ in 0..5 {
            lock.acquire();
        }
        lock.release_all();
        assert!(!lock.is_held());
        assert_eq!(lock.name(), "test");
    }
}
