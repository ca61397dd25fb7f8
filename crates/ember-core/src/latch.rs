//! Countdown latch used to await quiescence across a set of workers.
//!
//! The latch is a clone-shared counter: owners [`add`](CountdownLatch::add)
//! outstanding work, workers [`dec`](CountdownLatch::dec) it away, and a
//! joiner blocks in [`wait_for`](CountdownLatch::wait_for) until the count
//! reaches zero or the timeout expires. Unlike a barrier the count may be
//! re-raised after reaching zero, which migration flows rely on when a
//! finalization attempt is invalidated by late writes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Inner {
    count: Mutex<u64>,
    zero: Condvar,
}

/// Clone-shared countdown counter with timed waiting.
#[derive(Debug, Clone)]
pub struct CountdownLatch {
    inner: Arc<Inner>,
}

impl CountdownLatch {
    /// Creates a latch with the given initial count.
    #[must_use]
    pub fn new(count: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                count: Mutex::new(count),
                zero: Condvar::new(),
            }),
        }
    }

    /// Raises the count by one.
    pub fn add(&self) {
        *self.inner.count.lock() += 1;
    }

    /// Lowers the count by one, waking waiters when it reaches zero.
    ///
    /// Decrementing a zero latch is a balance bug in the caller; it is kept
    /// at zero and flagged in debug builds.
    pub fn dec(&self) {
        let mut count = self.inner.count.lock();
        debug_assert!(*count > 0, "countdown latch decremented below zero");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    /// Returns the current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        *self.inner.count.lock()
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.zero.wait(&mut count);
        }
    }

    /// Blocks until the count reaches zero or `timeout` elapses.
    ///
    /// Returns true if the count was observed at zero.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.inner.count.lock();
        while *count > 0 {
            if self.inner.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_latch_is_open() {
        let latch = CountdownLatch::new(0);
        assert!(latch.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_for_times_out() {
        let latch = CountdownLatch::new(1);
        assert!(!latch.wait_for(Duration::from_millis(10)));
        assert_eq!(latch.count(), 1);
    }

    #[test]
    fn test_dec_unblocks_waiter() {
        let latch = CountdownLatch::new(2);
        let worker = {
            let latch = latch.clone();
            thread::spawn(move || {
                latch.dec();
                latch.dec();
            })
        };
        assert!(latch.wait_for(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_add_rearms_after_zero() {
        let latch = CountdownLatch::new(1);
        latch.dec();
        assert!(latch.wait_for(Duration::from_millis(1)));

        latch.add();
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.dec();
        assert!(latch.wait_for(Duration::from_millis(10)));
    }
}
