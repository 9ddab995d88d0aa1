//! The priority-donation forest.
//!
//! Threads and locks form an alternating bipartite forest. An edge points
//! from a donor to its donee: thread -> lock means the thread is blocked on
//! the lock, lock -> thread means the lock is held by the thread. Every
//! node has out-degree at most one, so a chain of donations is a path that
//! ends either at a running thread or at an unheld lock. A node's priority
//! is the maximum of its own base (threads) or `PRI_MIN` (locks) and the
//! priority of its best donor.
//!
//! Linking a new donor can only raise priorities upward along its chain, and
//! the only edges ever cut are the ones touching a root, so an update is a
//! bounded upward walk: at most [`DONATION_MAX_DEPTH`] hops, re-sorting the
//! donor at each level. Operations run with interrupts masked, which on a
//! single CPU makes each walk atomic with respect to the scheduler.

use super::synch::LockId;
use super::thread::ThreadId;
use super::{Scheduler, PRI_MAX, PRI_MIN};

/// Maximum number of hops a donation cascade is propagated.
pub const DONATION_MAX_DEPTH: usize = 16;

impl Scheduler {
    /// Initializes a thread's donation state with the given base priority.
    pub(crate) fn donation_thread_init(&mut self, thread: ThreadId, base_priority: i8) {
        let t = self.threads.get_mut(thread);
        t.priority = base_priority;
        t.base_priority = base_priority;
        t.donee = None;
        debug_assert!(t.donors.is_empty());
    }

    /// Marks `thread` as blocked on `lock` and propagates its priority up
    /// the chain. The thread must not already be blocked on a lock.
    pub fn donation_thread_block(&mut self, thread: ThreadId, lock: LockId) {
        let old = self.intr.disable();
        assert!(
            self.threads.get(thread).donee.is_none(),
            "donor thread already blocked"
        );
        self.threads.get_mut(thread).donee = Some(lock);

        self.donation_thread_update_priority(thread);
        let priority = self.threads.get(thread).priority;
        self.locks[lock.0 as usize]
            .donors
            .push(thread, priority)
            .expect("lock donor set allocation");

        let mut lock = lock;
        for _depth in 0..DONATION_MAX_DEPTH {
            let Some(holder) = self.locks[lock.0 as usize].donee else {
                break;
            };
            self.donation_lock_update_priority(lock);
            self.donation_lock_update_donation(lock);

            let Some(next_lock) = self.threads.get(holder).donee else {
                self.donation_thread_update_priority(holder);
                self.ready_queue_update(holder);
                self.intr.set_level(old);
                return;
            };
            self.donation_thread_update_priority(holder);
            self.donation_thread_update_donation(holder);
            lock = next_lock;
        }
        if self.locks[lock.0 as usize].donee.is_none() {
            self.donation_lock_update_priority(lock);
        }
        self.intr.set_level(old);
    }

    /// Cuts the edge from `thread` to the lock it is blocked on. The lock
    /// must be unheld, so no propagation above it is needed.
    pub fn donation_thread_unblock(&mut self, thread: ThreadId) {
        let old = self.intr.disable();
        let lock = self
            .threads
            .get_mut(thread)
            .donee
            .take()
            .expect("unblocking a thread with no donee");
        assert!(
            self.locks[lock.0 as usize].donee.is_none(),
            "unblocking under a held lock"
        );
        self.locks[lock.0 as usize].donors.remove(thread);
        self.donation_lock_update_priority(lock);
        self.intr.set_level(old);
    }

    /// Records that `thread` now holds `lock`; the lock starts donating to
    /// it. The lock must be unheld.
    pub fn donation_thread_acquire(&mut self, thread: ThreadId, lock: LockId) {
        let old = self.intr.disable();
        assert!(
            self.locks[lock.0 as usize].donee.is_none(),
            "acquiring a held lock"
        );
        self.locks[lock.0 as usize].donee = Some(thread);
        self.donation_lock_update_priority(lock);

        let priority = self.locks[lock.0 as usize].priority;
        self.threads
            .get_mut(thread)
            .donors
            .push(lock, priority)
            .expect("thread donor set allocation");
        self.donation_thread_update_priority(thread);
        self.intr.set_level(old);
    }

    /// Cuts the edge from `lock` to its holder and restores the holder's
    /// priority from its remaining donors.
    pub fn donation_thread_release(&mut self, lock: LockId) {
        let old = self.intr.disable();
        let thread = self.locks[lock.0 as usize]
            .donee
            .take()
            .expect("releasing an unheld lock");
        assert!(
            self.threads.get(thread).donee.is_none(),
            "holder blocked while releasing"
        );
        self.threads.get_mut(thread).donors.remove(lock);
        self.donation_thread_update_priority(thread);
        self.ready_queue_update(thread);
        self.intr.set_level(old);
    }

    /// Sets `thread`'s base priority. The thread must not be blocked on a
    /// lock, and the priority must be within the scheduler's range.
    pub fn donation_set_base_priority(&mut self, thread: ThreadId, base_priority: i8) {
        let old = self.intr.disable();
        assert!(
            self.threads.get(thread).donee.is_none(),
            "setting base priority of a blocked donor"
        );
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&base_priority),
            "base priority out of range"
        );
        self.threads.get_mut(thread).base_priority = base_priority;
        self.donation_thread_update_priority(thread);
        self.ready_queue_update(thread);
        self.intr.set_level(old);
    }

    /// The thread's base priority, before donation.
    pub fn donation_get_base_priority(&self, thread: ThreadId) -> i8 {
        self.threads.get(thread).base_priority
    }

    /// Recomputes a thread's effective priority from its base priority and
    /// its best donor lock.
    fn donation_thread_update_priority(&mut self, thread: ThreadId) {
        let t = self.threads.get_mut(thread);
        let mut new_priority = t.base_priority;
        if let Some((donated, _)) = t.donors.top() {
            if donated > new_priority {
                new_priority = donated;
            }
        }
        t.priority = new_priority;
    }

    /// Recomputes a lock's priority from its best donor thread.
    fn donation_lock_update_priority(&mut self, lock: LockId) {
        let l = &mut self.locks[lock.0 as usize];
        l.priority = match l.donors.top() {
            Some((donated, _)) => donated,
            None => PRI_MIN,
        };
    }

    /// Re-sorts `lock` within its donee thread's donor set after the lock's
    /// priority changed.
    fn donation_lock_update_donation(&mut self, lock: LockId) {
        let holder = self.locks[lock.0 as usize]
            .donee
            .expect("re-sorting a donor with no donee");
        let priority = self.locks[lock.0 as usize].priority;
        self.threads.get_mut(holder).donors.update(lock, priority);
    }

    /// Re-sorts `thread` within its donee lock's donor set after the
    /// thread's priority changed.
    fn donation_thread_update_donation(&mut self, thread: ThreadId) {
        let lock = self
            .threads
            .get(thread)
            .donee
            .expect("re-sorting a donor with no donee");
        let priority = self.threads.get(thread).priority;
        self.locks[lock.0 as usize].donors.update(thread, priority);
    }
}
