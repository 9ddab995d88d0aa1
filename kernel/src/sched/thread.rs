//! Thread control blocks and the thread arena.
//!
//! Threads live in an arena owned by the scheduler; [`ThreadId`] is the
//! stable slot index that everything else (ready queues, donation forest,
//! synchronization primitives) stores instead of pointers. A monotonic
//! `tid` gives each thread its external identity, and a magic sentinel is
//! checked on every arena lookup the way the original stack-overflow canary
//! was checked on every `thread_current`.

use alloc::string::String;
use alloc::vec::Vec;

use super::fixed_point::Fixed32;
use super::pqueue::PQueue;
use super::synch::LockId;

/// Sentinel stored in every live TCB; a mismatch means the arena slot was
/// corrupted or the id is stale.
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Stable arena index of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u32);

/// Monotonic external thread identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// A thread control block.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,

    /// Effective priority: base priority or the best donation, whichever is
    /// higher. Read by the dispatcher; written only by the donation forest
    /// (or the MLFQS recalculation when feedback scheduling is on).
    pub priority: i8,
    /// Priority assigned by the programmer, before donation.
    pub base_priority: i8,
    /// The lock this thread is blocked on, if any. Out-degree <= 1.
    pub donee: Option<LockId>,
    /// Locks this thread holds, ordered by donated priority, highest first.
    pub donors: PQueue<i8, LockId>,

    /// MLFQS niceness in [-20, 20].
    pub nice: i8,
    /// MLFQS recent-CPU estimate.
    pub recent_cpu: Fixed32,

    /// Priority this thread was enqueued at, while READY. Lets the ready
    /// queues unlink the thread after its priority has already changed.
    pub(crate) queued_at: Option<i8>,

    magic: u32,
}

/// Max-first ordering for donor sets.
fn donor_greater(a: &i8, b: &i8) -> bool {
    a > b
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: &str) -> Thread {
        Thread {
            tid,
            name: String::from(name),
            state: ThreadState::Blocked,
            priority: 0,
            base_priority: 0,
            donee: None,
            donors: PQueue::new(donor_greater),
            nice: 0,
            recent_cpu: Fixed32::ZERO,
            queued_at: None,
            magic: THREAD_MAGIC,
        }
    }
}

/// Arena of thread control blocks.
///
/// Slots are reused after `thread_exit`; the scheduler is the only code
/// that allocates or frees them.
pub struct ThreadTable {
    slots: Vec<Option<Thread>>,
    next_tid: u32,
    limit: usize,
}

impl ThreadTable {
    pub(crate) fn new(limit: usize) -> ThreadTable {
        ThreadTable {
            slots: Vec::new(),
            next_tid: 1,
            limit,
        }
    }

    /// Allocates a slot for a new blocked thread, or `None` when the table
    /// is at its configured limit.
    pub(crate) fn alloc(&mut self, name: &str) -> Option<ThreadId> {
        let tid = Tid(self.next_tid);
        let thread = Thread::new(tid, name);
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                self.next_tid += 1;
                *slot = Some(thread);
                return Some(ThreadId(i as u32));
            }
        }
        if self.slots.len() >= self.limit {
            return None;
        }
        self.next_tid += 1;
        self.slots.push(Some(thread));
        Some(ThreadId(self.slots.len() as u32 - 1))
    }

    pub(crate) fn free(&mut self, id: ThreadId) {
        let slot = &mut self.slots[id.0 as usize];
        assert!(slot.is_some(), "freeing a dead thread slot");
        *slot = None;
    }

    pub(crate) fn get(&self, id: ThreadId) -> &Thread {
        let t = self.slots[id.0 as usize]
            .as_ref()
            .expect("stale thread id");
        assert_eq!(t.magic, THREAD_MAGIC, "thread arena corrupted");
        t
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> &mut Thread {
        let t = self.slots[id.0 as usize]
            .as_mut()
            .expect("stale thread id");
        assert_eq!(t.magic, THREAD_MAGIC, "thread arena corrupted");
        t
    }

    /// Iterates over all live threads, the all-threads list of the original
    /// design.
    pub(crate) fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| ThreadId(i as u32))
    }
}
