//! MLFQS feedback calculations.
//!
//! The multilevel feedback queue scheduler derives priorities from a
//! per-thread recent-CPU estimate and niceness, decayed against the system
//! load average:
//!
//! ```text
//! load_avg   = (59/60) * load_avg + (1/60) * ready_threads
//! recent_cpu = (2 * load_avg) / (2 * load_avg + 1) * recent_cpu + nice
//! priority   = PRI_MAX - recent_cpu / 4 - 2 * nice    (clamped)
//! ```
//!
//! `load_avg` decays once per second; `recent_cpu` of the running thread is
//! bumped every tick and all threads decay once per second; priorities are
//! recomputed every time slice. Donation is disabled in this mode.

use super::thread::ThreadId;
use super::{Scheduler, PRI_MAX, PRI_MIN};

impl Scheduler {
    /// One-second exponential decay of the load average.
    ///
    /// The contribution is the number of ready threads plus the running
    /// thread, or zero while idling.
    pub(crate) fn mlfqs_load_avg_decay(&mut self) {
        use super::fixed_point::Fixed32;
        let fifty_nine_sixtieths = Fixed32::from_int(59).div_int(60);
        let one_sixtieth = Fixed32::from_int(1).div_int(60);
        let running = if self.current == self.idle {
            0
        } else {
            self.ready.len() as i32 + 1
        };
        self.load_avg =
            fifty_nine_sixtieths.mul(self.load_avg) + one_sixtieth.mul_int(running);
    }

    /// One-second decay of a thread's recent CPU, followed by a priority
    /// recomputation and a ready-queue re-slot if needed.
    pub(crate) fn mlfqs_decay_thread(&mut self, thread: ThreadId) {
        if thread == self.idle {
            return;
        }
        let load_avg = self.load_avg;
        let t = self.threads.get_mut(thread);
        let twice_load_avg = load_avg.mul_int(2);
        let ratio = twice_load_avg.div(twice_load_avg.add_int(1));
        t.recent_cpu = ratio.mul(t.recent_cpu).add_int(t.nice as i32);

        self.mlfqs_update_priority(thread);
        self.ready_queue_update(thread);
    }

    /// Recomputes a thread's dynamic priority from recent CPU and niceness.
    pub(crate) fn mlfqs_update_priority(&mut self, thread: ThreadId) {
        let t = self.threads.get_mut(thread);
        let raw = PRI_MAX as i32
            - t.recent_cpu.div_int(4).to_int_round()
            - 2 * t.nice as i32;
        t.priority = raw.clamp(PRI_MIN as i32, PRI_MAX as i32) as i8;
    }
}
