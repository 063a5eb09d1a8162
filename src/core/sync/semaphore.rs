/*!
 * Heap Semaphore
 *
 * Binary semaphore built on parking_lot::Condvar. Acquisition blocks without
 * a timeout; release happens when the returned guard drops.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Blocking binary semaphore guarding one heap
#[derive(Debug, Default)]
pub struct Semaphore {
    held: Mutex<bool>,
    condvar: Condvar,
    waiters: Mutex<usize>,
    contended: AtomicU64,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the semaphore, parking the calling thread until it is free
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut held = self.held.lock();
        if *held {
            self.contended.fetch_add(1, Ordering::Relaxed);
            *self.waiters.lock() += 1;
            while *held {
                self.condvar.wait(&mut held);
            }
            *self.waiters.lock() -= 1;
        }
        *held = true;
        SemaphoreGuard { semaphore: self }
    }

    /// Acquire only if nobody holds the semaphore
    pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
        let mut held = self.held.lock();
        if *held {
            return None;
        }
        *held = true;
        Some(SemaphoreGuard { semaphore: self })
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    /// Number of threads currently parked in `acquire`
    pub fn waiter_count(&self) -> usize {
        *self.waiters.lock()
    }

    /// How many acquisitions had to wait
    pub fn contention_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        drop(held);
        self.condvar.notify_one();
    }
}

/// Held semaphore; releases on drop
#[must_use = "the semaphore is released as soon as the guard drops"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
