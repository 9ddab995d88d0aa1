//! The thread scheduler.
//!
//! A single-CPU preemptive priority scheduler: 64 ready queues indexed by
//! priority with round-robin inside a level, strict ordering between
//! levels, priority donation through locks (round-robin mode) or MLFQS
//! feedback (when [`SchedConfig::mlfqs`] is set), and time-slice preemption
//! every [`TIME_SLICE`] ticks.
//!
//! The scheduler is an explicit value. Dispatch moves the `current` thread
//! id between arena slots; saving and restoring machine context belongs to
//! the architecture layer outside this crate, and no behavior here depends
//! on it. Interrupt masking is modeled by [`IntrLevel`] bookkeeping, which
//! is the round-robin donation variant's synchronization strategy and the
//! single source of atomicity on one CPU.

mod donation;
pub mod fixed_point;
mod mlfqs;
pub mod pqueue;
mod queue;
pub mod synch;
mod thread;

pub use donation::DONATION_MAX_DEPTH;
pub use fixed_point::Fixed32;
pub use synch::{CondId, LockId, SemaId};
pub use thread::{ThreadId, ThreadState, Tid};

use alloc::vec::Vec;

use crate::error::KernelError;
use queue::ReadyQueues;
use thread::ThreadTable;

/// Lowest priority.
pub const PRI_MIN: i8 = 0;
/// Default priority.
pub const PRI_DEFAULT: i8 = 31;
/// Highest priority.
pub const PRI_MAX: i8 = 63;

/// Lowest niceness.
pub const NICE_MIN: i8 = -20;
/// Default niceness.
pub const NICE_DEFAULT: i8 = 0;
/// Highest niceness.
pub const NICE_MAX: i8 = 20;

/// Timer ticks per time slice.
pub const TIME_SLICE: u32 = 4;
/// Timer ticks per second.
pub const TIMER_FREQ: u64 = 100;

/// Interrupt level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    On,
    Off,
}

/// Tracked interrupt state. On this single modeled CPU, masking brackets
/// are what make scheduler and donation operations atomic.
pub(crate) struct IntrState {
    level: IntrLevel,
}

impl IntrState {
    fn new() -> IntrState {
        IntrState {
            level: IntrLevel::On,
        }
    }

    /// Masks interrupts, returning the previous level for restoration.
    pub(crate) fn disable(&mut self) -> IntrLevel {
        core::mem::replace(&mut self.level, IntrLevel::Off)
    }

    pub(crate) fn set_level(&mut self, level: IntrLevel) {
        self.level = level;
    }

    pub(crate) fn get_level(&self) -> IntrLevel {
        self.level
    }
}

/// Scheduler construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct SchedConfig {
    /// Use the multilevel feedback queue scheduler instead of round-robin
    /// with donation.
    pub mlfqs: bool,
    /// Maximum number of live threads.
    pub max_threads: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            mlfqs: false,
            max_threads: 256,
        }
    }
}

/// The scheduler.
pub struct Scheduler {
    pub(crate) threads: ThreadTable,
    pub(crate) ready: ReadyQueues,
    pub(crate) current: ThreadId,
    pub(crate) idle: ThreadId,

    pub(crate) locks: Vec<synch::Lock>,
    pub(crate) semas: Vec<synch::Semaphore>,
    pub(crate) conds: Vec<synch::Condition>,

    pub(crate) mlfqs: bool,
    pub(crate) load_avg: Fixed32,
    ticks: u64,
    slice_ticks: u32,
    pub(crate) intr: IntrState,
}

impl Scheduler {
    /// Creates the scheduler, transforming the caller into the running
    /// "main" thread and setting up the idle thread.
    pub fn new(config: SchedConfig) -> Scheduler {
        let mut threads = ThreadTable::new(config.max_threads);
        let main = threads.alloc("main").expect("thread table empty at boot");
        let idle = threads.alloc("idle").expect("thread table empty at boot");

        let mut sched = Scheduler {
            threads,
            ready: ReadyQueues::new(),
            current: main,
            idle,
            locks: Vec::new(),
            semas: Vec::new(),
            conds: Vec::new(),
            mlfqs: config.mlfqs,
            load_avg: Fixed32::ZERO,
            ticks: 0,
            slice_ticks: 0,
            intr: IntrState::new(),
        };

        if sched.mlfqs {
            let t = sched.threads.get_mut(main);
            t.nice = NICE_DEFAULT;
            t.recent_cpu = Fixed32::ZERO;
            sched.mlfqs_update_priority(main);
        } else {
            sched.donation_thread_init(main, PRI_DEFAULT);
        }
        sched.donation_thread_init(idle, PRI_MIN);
        sched.threads.get_mut(main).state = ThreadState::Running;
        // The idle thread never sits on a ready queue; it is dispatched
        // directly when nothing is ready.
        sched.threads.get_mut(idle).state = ThreadState::Blocked;

        log::debug!(
            "scheduler up: mlfqs={}, max_threads={}",
            config.mlfqs,
            config.max_threads
        );
        sched
    }

    /// Creates a new thread, ready to run.
    ///
    /// In round-robin mode the thread starts at `priority`; in MLFQS mode
    /// it inherits the creator's niceness and recent CPU and `priority` is
    /// ignored. If the new thread outranks the caller, the caller yields.
    pub fn thread_create(&mut self, name: &str, priority: i8) -> Result<ThreadId, KernelError> {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "thread priority out of range"
        );
        let id = self
            .threads
            .alloc(name)
            .ok_or(KernelError::ResourceExhausted {
                resource: "thread slots",
            })?;

        if self.mlfqs {
            let cur = self.current;
            let (nice, recent_cpu) = {
                let c = self.threads.get(cur);
                (c.nice, c.recent_cpu)
            };
            let t = self.threads.get_mut(id);
            t.nice = nice;
            t.recent_cpu = recent_cpu;
            self.mlfqs_update_priority(id);
        } else {
            self.donation_thread_init(id, priority);
        }

        self.thread_unblock(id);
        self.thread_priority_yield();
        Ok(id)
    }

    /// The running thread.
    pub fn thread_current(&self) -> ThreadId {
        self.current
    }

    /// The running thread's name.
    pub fn thread_name(&self) -> &str {
        &self.threads.get(self.current).name
    }

    /// External identity of a thread.
    pub fn thread_tid(&self, thread: ThreadId) -> Tid {
        self.threads.get(thread).tid
    }

    /// A thread's lifecycle state.
    pub fn thread_state(&self, thread: ThreadId) -> ThreadState {
        self.threads.get(thread).state
    }

    /// A thread's effective priority.
    pub fn thread_priority(&self, thread: ThreadId) -> i8 {
        self.threads.get(thread).priority
    }

    /// Name of an arbitrary thread, for assertions in tests.
    pub fn thread_name_of(&self, thread: ThreadId) -> &str {
        &self.threads.get(thread).name
    }

    /// Number of threads on the ready queues.
    pub fn threads_ready(&self) -> usize {
        self.ready.len()
    }

    /// Ticks since boot.
    pub fn timer_ticks(&self) -> u64 {
        self.ticks
    }

    /// The idle thread's id.
    pub fn idle_thread(&self) -> ThreadId {
        self.idle
    }

    /// Blocks the current thread. It will not run again until
    /// [`Scheduler::thread_unblock`].
    pub fn thread_block(&mut self) {
        let old = self.intr.disable();
        self.threads.get_mut(self.current).state = ThreadState::Blocked;
        self.schedule();
        self.intr.set_level(old);
    }

    /// Transitions a blocked thread to ready. Does not preempt: callers
    /// that need preemption follow up with [`Scheduler::thread_priority_yield`].
    pub fn thread_unblock(&mut self, thread: ThreadId) {
        let old = self.intr.disable();
        assert_eq!(
            self.threads.get(thread).state,
            ThreadState::Blocked,
            "unblocking a thread that is not blocked"
        );
        self.ready_push(thread);
        self.threads.get_mut(thread).state = ThreadState::Ready;
        self.intr.set_level(old);
    }

    /// Yields the CPU; the current thread goes back to its ready queue.
    pub fn thread_yield(&mut self) {
        let old = self.intr.disable();
        let cur = self.current;
        self.threads.get_mut(cur).state = ThreadState::Ready;
        if cur != self.idle {
            self.ready_push(cur);
        }
        self.schedule();
        self.intr.set_level(old);
    }

    /// If the current thread no longer has the highest priority, yield.
    pub fn thread_priority_yield(&mut self) {
        let old = self.intr.disable();
        let preempt = match self.ready.front() {
            Some(front) => {
                self.current == self.idle
                    || self.threads.get(front).priority > self.threads.get(self.current).priority
            }
            None => false,
        };
        self.intr.set_level(old);
        if preempt {
            self.thread_yield();
        }
    }

    /// Deschedules and destroys the current thread. The next thread to run
    /// reclaims its slot.
    pub fn thread_exit(&mut self) {
        assert_ne!(self.current, self.idle, "idle thread cannot exit");
        self.intr.disable();
        self.threads.get_mut(self.current).state = ThreadState::Dying;
        self.schedule();
        self.intr.set_level(IntrLevel::On);
    }

    /// Sets the current thread's base priority (round-robin mode only),
    /// yielding if it is overtaken.
    pub fn thread_set_priority(&mut self, priority: i8) {
        if self.mlfqs {
            return;
        }
        self.donation_set_base_priority(self.current, priority);
        self.thread_priority_yield();
    }

    /// The current thread's effective priority.
    pub fn thread_get_priority(&self) -> i8 {
        self.threads.get(self.current).priority
    }

    /// Sets the current thread's niceness (MLFQS mode only), recomputing
    /// its priority and yielding if it is overtaken.
    pub fn thread_set_nice(&mut self, nice: i8) {
        if !self.mlfqs {
            return;
        }
        let old = self.intr.disable();
        let cur = self.current;
        self.threads.get_mut(cur).nice = nice.clamp(NICE_MIN, NICE_MAX);
        self.mlfqs_update_priority(cur);
        self.thread_priority_yield();
        self.intr.set_level(old);
    }

    /// The current thread's niceness.
    pub fn thread_get_nice(&self) -> i8 {
        if self.mlfqs {
            self.threads.get(self.current).nice
        } else {
            0
        }
    }

    /// 100 times the system load average, rounded.
    pub fn thread_get_load_avg(&self) -> i32 {
        if self.mlfqs {
            self.load_avg.mul_int(100).to_int_round()
        } else {
            0
        }
    }

    /// 100 times the current thread's recent CPU, rounded.
    pub fn thread_get_recent_cpu(&self) -> i32 {
        if self.mlfqs {
            self.threads
                .get(self.current)
                .recent_cpu
                .mul_int(100)
                .to_int_round()
        } else {
            0
        }
    }

    /// Timer tick. Runs scheduler accounting, the MLFQS feedback updates,
    /// and time-slice preemption.
    pub fn thread_tick(&mut self) {
        self.ticks += 1;

        if self.mlfqs {
            let cur = self.current;
            if cur != self.idle {
                let t = self.threads.get_mut(cur);
                t.recent_cpu = t.recent_cpu.add_int(1);
            }
            if self.ticks % TIMER_FREQ == 0 {
                self.mlfqs_load_avg_decay();
                let live: Vec<ThreadId> = self.threads.ids().collect();
                for t in live {
                    self.mlfqs_decay_thread(t);
                }
            }
        }

        self.slice_ticks += 1;
        if self.slice_ticks >= TIME_SLICE {
            let cur = self.current;
            if self.mlfqs && cur != self.idle {
                self.mlfqs_update_priority(cur);
            }
            // Preemption on return from the timer interrupt.
            self.thread_yield();
        }
    }

    /// Re-slots a READY thread whose priority changed; no-op otherwise.
    /// Keeps dispatch order consistent with effective priorities.
    pub(crate) fn ready_queue_update(&mut self, thread: ThreadId) {
        if self.threads.get(thread).state != ThreadState::Ready {
            return;
        }
        let old = self.intr.disable();
        self.ready_remove(thread);
        self.ready_push(thread);
        self.intr.set_level(old);
    }

    fn ready_push(&mut self, thread: ThreadId) {
        let priority = self.threads.get(thread).priority;
        self.ready.push(thread, priority);
        self.threads.get_mut(thread).queued_at = Some(priority);
    }

    fn ready_remove(&mut self, thread: ThreadId) {
        let queued_at = self
            .threads
            .get_mut(thread)
            .queued_at
            .take()
            .expect("thread not on a ready queue");
        self.ready.remove(thread, queued_at);
    }

    fn ready_pop(&mut self) -> Option<ThreadId> {
        let thread = self.ready.pop()?;
        self.threads.get_mut(thread).queued_at = None;
        Some(thread)
    }

    /// Dispatches the next thread: the head of the highest non-empty ready
    /// queue, or idle. Frees the previous thread if it was dying.
    pub(crate) fn schedule(&mut self) {
        assert_eq!(
            self.intr.get_level(),
            IntrLevel::Off,
            "schedule with interrupts on"
        );
        let prev = self.current;
        let next = self.ready_pop().unwrap_or(self.idle);
        self.threads.get_mut(next).state = ThreadState::Running;
        self.current = next;
        self.slice_ticks = 0;

        if prev != next && self.threads.get(prev).state == ThreadState::Dying {
            self.threads.free(prev);
        }
    }
}
