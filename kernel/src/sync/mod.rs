//! Kernel-internal synchronization.
//!
//! The scheduler-integrated primitives in [`crate::sched::synch`] block
//! *scheduled* threads. The VM core additionally needs a primitive whose
//! waiters are the host-level execution contexts driving it; this counting
//! semaphore spins on an atomic counter and is safe to share across those
//! contexts.

use core::sync::atomic::{AtomicUsize, Ordering};

/// A counting semaphore over an atomic counter.
///
/// `down` spins until a permit is available. The only long-term waiter in
/// the kernel is `frame_get` parked on the `unlocked_frames` count, which
/// is released as soon as any frame is unlocked or freed.
pub struct Semaphore {
    count: AtomicUsize,
}

impl Semaphore {
    /// Creates a semaphore holding `count` permits.
    pub const fn new(count: usize) -> Semaphore {
        Semaphore {
            count: AtomicUsize::new(count),
        }
    }

    /// Takes a permit, spinning until one is available.
    pub fn down(&self) {
        loop {
            if self.try_down() {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Takes a permit if one is available.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
    }

    /// Returns a permit.
    pub fn up(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Current permit count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
