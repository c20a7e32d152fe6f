//! Small blocking primitives the daemon is built on: a counting
//! semaphore for the local-compile throttle and a countdown latch for
//! per-invocation waits. Plain `Mutex` + `Condvar`, nothing clever.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore with RAII permits.
pub struct Semaphore {
    available: Mutex<usize>,
    cond: Condvar,
}

pub struct Permit<'a>(&'a Semaphore);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self { available: Mutex::new(permits), cond: Condvar::new() }
    }

    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.cond.wait(available).unwrap();
        }
        *available -= 1;
        Permit(self)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.0.available.lock().unwrap() += 1;
        self.0.cond.notify_one();
    }
}

/// A countdown latch: waiters block until the count reaches zero. The
/// count can be forced to zero to release everyone (cancellation).
pub struct CountdownLatch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl CountdownLatch {
    pub fn new() -> Self {
        Self { count: Mutex::new(0), cond: Condvar::new() }
    }

    pub fn add(&self, n: usize) {
        *self.count.lock().unwrap() += n;
    }

    /// Decrement; the last decrement wakes all waiters. Safe to call on
    /// an already-zero latch (forced release races with stragglers).
    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn force_zero(&self) {
        let mut count = self.count.lock().unwrap();
        *count = 0;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }

    /// Bounded wait; returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }
        true
    }
}

impl Default for CountdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn semaphore_limits_parallelism() {
        let sem = Arc::new(Semaphore::new(3));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let (sem, peak, current) = (sem.clone(), peak.clone(), current.clone());
                std::thread::spawn(move || {
                    let _p = sem.acquire();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn latch_releases_at_zero() {
        let latch = Arc::new(CountdownLatch::new());
        latch.add(2);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));

        let waiter = {
            let latch = latch.clone();
            std::thread::spawn(move || latch.wait())
        };
        latch.count_down();
        latch.count_down();
        waiter.join().unwrap();
        // extra decrements don't underflow
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn force_zero_releases_waiters() {
        let latch = Arc::new(CountdownLatch::new());
        latch.add(100);
        let waiter = {
            let latch = latch.clone();
            std::thread::spawn(move || latch.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        latch.force_zero();
        waiter.join().unwrap();
    }
}
