//! Counting semaphore for the render/decode boundary.
//!
//! The render callback calls [`Semaphore::signal`] after it frees ring space;
//! the decode thread blocks in [`Semaphore::wait_timeout`] while it has
//! nothing to do. `signal` never takes the mutex, so a notification may race
//! a waiter that has checked the permit count but not yet parked. Every wait
//! is bounded, which caps that race at one timeout period.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Semaphore {
    permits: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Release one permit and wake a waiter.
    ///
    /// Never takes the semaphore mutex. `notify_one` may still briefly lock
    /// a parking_lot bucket when a waiter is parked, which is bounded and
    /// never contended with the decode thread's own lock.
    pub fn signal(&self) {
        self.permits.fetch_add(1, Ordering::Release);
        self.cond.notify_one();
    }

    /// Take one permit if available.
    pub fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |p| p.checked_sub(1))
            .is_ok()
    }

    /// Block until a permit is available.
    pub fn wait(&self) {
        let mut guard = self.lock.lock();
        while !self.try_acquire() {
            // Re-check periodically; `signal` does not hold the lock.
            self.cond.wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    /// Block until a permit is available or `timeout` elapses.
    ///
    /// Returns `true` if a permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.try_acquire() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if self.try_acquire() {
                return true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.try_acquire();
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// Take every available permit, returning how many were taken.
    pub fn drain(&self) -> usize {
        self.permits.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_permits_are_counted() {
        let sem = Semaphore::new(1);
        sem.signal();
        assert_eq!(sem.available_permits(), 2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_wait_timeout_expires_without_signal() {
        let sem = Semaphore::new(0);
        let started = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        sem.signal();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn test_blocking_wait() {
        let sem = Arc::new(Semaphore::new(0));
        let signaller = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                sem.signal();
            })
        };
        sem.wait();
        signaller.join().unwrap();
    }

    #[test]
    fn test_drain() {
        let sem = Semaphore::new(3);
        assert_eq!(sem.drain(), 3);
        assert_eq!(sem.available_permits(), 0);
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }
}
