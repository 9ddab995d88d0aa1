//! Scheduler-integrated synchronization primitives.
//!
//! Counting semaphores, locks and condition variables that block and wake
//! threads through the scheduler. Locks are donation nodes: acquisition and
//! release drive the donation forest so a starved holder inherits the
//! priority of its best waiter.
//!
//! Wakeups use a handoff model: when a primitive is released with waiters
//! queued, the permit (or lock ownership) is transferred directly to the
//! highest-priority waiter as it is unblocked. This is observably the same
//! as waking the thread and letting it retry, and it keeps every state
//! transition inside one scheduler operation.

use alloc::vec::Vec;

use super::pqueue::PQueue;
use super::thread::{ThreadId, ThreadState};
use super::{Scheduler, PRI_MIN};

/// Stable arena index of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub(crate) u32);

/// Stable arena index of a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaId(pub(crate) u32);

/// Stable arena index of a condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CondId(pub(crate) u32);

/// A counting semaphore.
pub(crate) struct Semaphore {
    pub value: u32,
    pub waiters: Vec<ThreadId>,
}

/// A lock: binary semaphore plus holder tracking and a donation node.
pub(crate) struct Lock {
    pub available: bool,
    /// Holding thread, for debugging and donation dispatch.
    pub holder: Option<ThreadId>,
    pub waiters: Vec<ThreadId>,

    /// Donated priority: max priority of the threads waiting on this lock,
    /// `PRI_MIN` when nobody waits.
    pub priority: i8,
    /// The thread holding this lock, as a donation edge. Out-degree <= 1.
    pub donee: Option<ThreadId>,
    /// Threads blocked on this lock, ordered by priority, highest first.
    pub donors: PQueue<i8, ThreadId>,
}

/// A condition variable.
pub(crate) struct Condition {
    pub waiters: Vec<ThreadId>,
}

fn donor_greater(a: &i8, b: &i8) -> bool {
    a > b
}

impl Lock {
    fn new() -> Lock {
        Lock {
            available: true,
            holder: None,
            waiters: Vec::new(),
            priority: PRI_MIN,
            donee: None,
            donors: PQueue::new(donor_greater),
        }
    }
}

impl Scheduler {
    /// Creates a counting semaphore with the given initial value.
    pub fn sema_create(&mut self, value: u32) -> SemaId {
        self.semas.push(Semaphore {
            value,
            waiters: Vec::new(),
        });
        SemaId(self.semas.len() as u32 - 1)
    }

    /// Down (P): takes a permit, blocking the current thread if none is
    /// available.
    pub fn sema_down(&mut self, sema: SemaId) {
        let old = self.intr.disable();
        let s = &mut self.semas[sema.0 as usize];
        if s.value > 0 {
            s.value -= 1;
        } else {
            let cur = self.current;
            s.waiters.push(cur);
            self.threads.get_mut(cur).state = ThreadState::Blocked;
            self.schedule();
        }
        self.intr.set_level(old);
    }

    /// Down (P) without blocking; returns whether a permit was taken.
    pub fn sema_try_down(&mut self, sema: SemaId) -> bool {
        let old = self.intr.disable();
        let s = &mut self.semas[sema.0 as usize];
        let ok = s.value > 0;
        if ok {
            s.value -= 1;
        }
        self.intr.set_level(old);
        ok
    }

    /// Up (V): hands the permit to the highest-priority waiter, or banks it.
    pub fn sema_up(&mut self, sema: SemaId) {
        let old = self.intr.disable();
        let s = &mut self.semas[sema.0 as usize];
        if let Some(at) = pick_waiter(&s.waiters, &self.threads) {
            let woken = s.waiters.remove(at);
            self.thread_unblock(woken);
        } else {
            s.value += 1;
        }
        self.intr.set_level(old);
        self.thread_priority_yield();
    }

    /// Current semaphore value (permits banked, not counting handoffs).
    pub fn sema_value(&self, sema: SemaId) -> u32 {
        self.semas[sema.0 as usize].value
    }

    /// Creates a lock.
    pub fn lock_create(&mut self) -> LockId {
        self.locks.push(Lock::new());
        LockId(self.locks.len() as u32 - 1)
    }

    /// Acquires `lock` as the current thread, blocking (and donating
    /// priority) while another thread holds it.
    pub fn lock_acquire(&mut self, lock: LockId) {
        assert!(
            !self.lock_held_by_current(lock),
            "recursive lock_acquire"
        );
        let old = self.intr.disable();
        let cur = self.current;
        if self.locks[lock.0 as usize].available {
            self.locks[lock.0 as usize].available = false;
            self.locks[lock.0 as usize].holder = Some(cur);
            if !self.mlfqs {
                self.donation_thread_acquire(cur, lock);
            }
        } else {
            if !self.mlfqs {
                self.donation_thread_block(cur, lock);
            }
            self.locks[lock.0 as usize].waiters.push(cur);
            self.threads.get_mut(cur).state = ThreadState::Blocked;
            // Ownership is handed to us by the releasing thread; by the
            // time we are dispatched again the donation edges and holder
            // field are already ours.
            self.schedule();
        }
        self.intr.set_level(old);
    }

    /// Acquires `lock` without blocking; returns whether it was taken.
    pub fn lock_try_acquire(&mut self, lock: LockId) -> bool {
        let old = self.intr.disable();
        let cur = self.current;
        let ok = self.locks[lock.0 as usize].available;
        if ok {
            self.locks[lock.0 as usize].available = false;
            self.locks[lock.0 as usize].holder = Some(cur);
            if !self.mlfqs {
                self.donation_thread_acquire(cur, lock);
            }
        }
        self.intr.set_level(old);
        ok
    }

    /// Releases `lock`, handing it to the highest-priority waiter if any.
    pub fn lock_release(&mut self, lock: LockId) {
        assert!(
            self.lock_held_by_current(lock),
            "lock_release by non-holder"
        );
        let old = self.intr.disable();
        self.lock_release_inner(lock);
        self.intr.set_level(old);
        self.thread_priority_yield();
    }

    /// Release without the trailing preemption check. Used by `cond_wait`,
    /// which must not switch threads between releasing the lock and
    /// blocking on the condition.
    fn lock_release_inner(&mut self, lock: LockId) {
        if !self.mlfqs {
            self.donation_thread_release(lock);
        }
        self.locks[lock.0 as usize].holder = None;
        if let Some(at) = pick_waiter(&self.locks[lock.0 as usize].waiters, &self.threads) {
            let woken = self.locks[lock.0 as usize].waiters.remove(at);
            if !self.mlfqs {
                // The woken thread completes its acquisition: its donation
                // edge to the lock is cut and replaced by ownership.
                self.donation_thread_unblock(woken);
                self.donation_thread_acquire(woken, lock);
            }
            self.locks[lock.0 as usize].holder = Some(woken);
            self.thread_unblock(woken);
        } else {
            self.locks[lock.0 as usize].available = true;
        }
    }

    /// Whether the current thread holds `lock`.
    pub fn lock_held_by_current(&self, lock: LockId) -> bool {
        self.locks[lock.0 as usize].holder == Some(self.current)
    }

    /// The thread currently holding `lock`.
    pub fn lock_holder(&self, lock: LockId) -> Option<ThreadId> {
        self.locks[lock.0 as usize].holder
    }

    /// The lock's donated priority.
    pub fn lock_priority(&self, lock: LockId) -> i8 {
        self.locks[lock.0 as usize].priority
    }

    /// Creates a condition variable.
    pub fn cond_create(&mut self) -> CondId {
        self.conds.push(Condition {
            waiters: Vec::new(),
        });
        CondId(self.conds.len() as u32 - 1)
    }

    /// Atomically releases `lock` and waits on `cond`. The lock is
    /// re-acquired on behalf of this thread when it is signalled.
    pub fn cond_wait(&mut self, cond: CondId, lock: LockId) {
        assert!(self.lock_held_by_current(lock), "cond_wait without lock");
        let old = self.intr.disable();
        let cur = self.current;
        self.conds[cond.0 as usize].waiters.push(cur);
        self.lock_release_inner(lock);
        self.threads.get_mut(cur).state = ThreadState::Blocked;
        self.schedule();
        self.intr.set_level(old);
    }

    /// Wakes the highest-priority waiter of `cond`. The caller must hold
    /// `lock`; the woken thread contends for it and runs once it both owns
    /// the lock and is scheduled.
    pub fn cond_signal(&mut self, cond: CondId, lock: LockId) {
        assert!(self.lock_held_by_current(lock), "cond_signal without lock");
        let old = self.intr.disable();
        if let Some(at) = pick_waiter(&self.conds[cond.0 as usize].waiters, &self.threads) {
            let woken = self.conds[cond.0 as usize].waiters.remove(at);
            self.wake_into_lock(woken, lock);
        }
        self.intr.set_level(old);
    }

    /// Wakes every waiter of `cond`.
    pub fn cond_broadcast(&mut self, cond: CondId, lock: LockId) {
        assert!(self.lock_held_by_current(lock), "cond_broadcast without lock");
        let old = self.intr.disable();
        while let Some(at) = pick_waiter(&self.conds[cond.0 as usize].waiters, &self.threads) {
            let woken = self.conds[cond.0 as usize].waiters.remove(at);
            self.wake_into_lock(woken, lock);
        }
        self.intr.set_level(old);
    }

    /// Moves a signalled thread from a condition onto the lock it must
    /// re-acquire. The caller still holds the lock, so the thread stays
    /// blocked as a lock waiter and donates to the holder.
    fn wake_into_lock(&mut self, woken: ThreadId, lock: LockId) {
        debug_assert!(!self.locks[lock.0 as usize].available);
        if !self.mlfqs {
            self.donation_thread_block(woken, lock);
        }
        self.locks[lock.0 as usize].waiters.push(woken);
    }
}

/// Index of the earliest waiter with the maximum priority, preserving FIFO
/// order among equals.
fn pick_waiter(
    waiters: &[ThreadId],
    threads: &super::thread::ThreadTable,
) -> Option<usize> {
    let mut best: Option<(usize, i8)> = None;
    for (i, &t) in waiters.iter().enumerate() {
        let p = threads.get(t).priority;
        match best {
            Some((_, bp)) if bp >= p => {}
            _ => best = Some((i, p)),
        }
    }
    best.map(|(i, _)| i)
}
