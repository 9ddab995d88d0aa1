//! Scheduler tests: dispatch order, preemption, and MLFQS feedback.

use corvid_kernel::sched::{SchedConfig, Scheduler, ThreadState, PRI_DEFAULT, TIME_SLICE};

fn round_robin_sched() -> Scheduler {
    Scheduler::new(SchedConfig {
        mlfqs: false,
        max_threads: 64,
    })
}

// ===== Dispatch order =====

#[test]
fn fifo_within_a_priority_level() {
    let mut sched = round_robin_sched();
    let t1 = sched.thread_create("a", 10).unwrap();
    let t2 = sched.thread_create("b", 10).unwrap();
    let t3 = sched.thread_create("c", 10).unwrap();

    // Main still outranks them; nothing dispatched yet.
    assert_eq!(sched.thread_name(), "main");
    assert_eq!(sched.threads_ready(), 3);

    // Dropping main's priority below them dispatches in unblock order.
    sched.thread_set_priority(5);
    assert_eq!(sched.thread_current(), t1);
    sched.thread_yield();
    assert_eq!(sched.thread_current(), t2);
    sched.thread_yield();
    assert_eq!(sched.thread_current(), t3);
    sched.thread_yield();
    assert_eq!(sched.thread_current(), t1);
}

#[test]
fn strict_priority_between_levels() {
    let mut sched = round_robin_sched();
    let low = sched.thread_create("low", 8).unwrap();
    let high = sched.thread_create("high", 50).unwrap();

    // Creation of a higher-priority thread preempts immediately.
    assert_eq!(sched.thread_current(), high);

    sched.thread_exit();
    assert_eq!(sched.thread_name(), "main");
    sched.thread_set_priority(1);
    assert_eq!(sched.thread_current(), low);
}

#[test]
fn unblock_does_not_preempt_until_yield() {
    let mut sched = round_robin_sched();
    let high = sched.thread_create("high", 60).unwrap();
    assert_eq!(sched.thread_current(), high);

    // High blocks; main resumes.
    sched.thread_block();
    assert_eq!(sched.thread_name(), "main");
    assert_eq!(sched.thread_state(high), ThreadState::Blocked);

    // Unblock alone must not switch.
    sched.thread_unblock(high);
    assert_eq!(sched.thread_name(), "main");

    // The return-from-interrupt check does.
    sched.thread_priority_yield();
    assert_eq!(sched.thread_current(), high);
}

#[test]
fn exited_thread_slot_is_reclaimed() {
    let mut sched = round_robin_sched();
    let t = sched.thread_create("doomed", 55).unwrap();
    assert_eq!(sched.thread_current(), t);
    sched.thread_exit();
    assert_eq!(sched.thread_name(), "main");
    // A new thread may land in the reclaimed slot and must be usable.
    let again = sched.thread_create("fresh", 12).unwrap();
    assert_eq!(sched.thread_state(again), ThreadState::Ready);
}

// ===== Time-slice preemption =====

#[test]
fn slice_expiry_round_robins_equal_priorities() {
    let mut sched = round_robin_sched();
    let a = sched.thread_create("a", 40).unwrap();
    assert_eq!(sched.thread_current(), a);
    let b = sched.thread_create("b", 40).unwrap();
    assert_eq!(sched.thread_current(), a);

    for _ in 0..TIME_SLICE {
        sched.thread_tick();
    }
    assert_eq!(sched.thread_current(), b);

    for _ in 0..TIME_SLICE {
        sched.thread_tick();
    }
    assert_eq!(sched.thread_current(), a);
}

#[test]
fn idle_runs_only_when_nothing_is_ready() {
    let mut sched = round_robin_sched();
    // Main blocks with an empty ready set; idle takes over.
    sched.thread_block();
    assert_eq!(sched.thread_current(), sched.idle_thread());

    // Note: `main` is gone for good here (nothing will unblock it); a
    // freshly created thread still preempts idle.
    let t = sched.thread_create("worker", 1).unwrap();
    sched.thread_priority_yield();
    assert_eq!(sched.thread_current(), t);
}

// ===== Priority setting =====

#[test]
fn set_priority_yields_when_overtaken() {
    let mut sched = round_robin_sched();
    let t = sched.thread_create("t", 20).unwrap();
    assert_eq!(sched.thread_name(), "main");
    assert_eq!(sched.thread_get_priority(), PRI_DEFAULT);

    sched.thread_set_priority(10);
    assert_eq!(sched.thread_current(), t);
}

// ===== MLFQS =====

fn mlfqs_sched() -> Scheduler {
    Scheduler::new(SchedConfig {
        mlfqs: true,
        max_threads: 64,
    })
}

#[test]
fn mlfqs_ignores_thread_set_priority() {
    let mut sched = mlfqs_sched();
    let before = sched.thread_get_priority();
    sched.thread_set_priority(3);
    assert_eq!(sched.thread_get_priority(), before);
}

#[test]
fn mlfqs_load_average_tracks_ready_threads() {
    let mut sched = mlfqs_sched();
    for name in ["a", "b", "c"] {
        sched.thread_create(name, PRI_DEFAULT).unwrap();
    }
    assert_eq!(sched.thread_get_load_avg(), 0);

    // Four CPU-bound threads pinned for 60 seconds.
    for _ in 0..6000 {
        sched.thread_tick();
    }
    let after_minute = sched.thread_get_load_avg();
    assert!(
        after_minute > 200 && after_minute <= 400,
        "load_avg x100 after 60s: {}",
        after_minute
    );

    // Convergence to the steady-state value of 4.
    for _ in 0..54000 {
        sched.thread_tick();
    }
    let converged = sched.thread_get_load_avg();
    assert!(
        (395..=405).contains(&converged),
        "load_avg x100 after 600s: {}",
        converged
    );
}

#[test]
fn mlfqs_nice_drops_priority_and_yields() {
    let mut sched = mlfqs_sched();
    for name in ["a", "b", "c"] {
        sched.thread_create(name, PRI_DEFAULT).unwrap();
    }

    let selfish = sched.thread_current();
    let before = sched.thread_get_priority() as i32;
    sched.thread_set_nice(10);

    // 2 * nice lower than before, and no longer running.
    let dropped = sched.thread_priority(selfish) as i32;
    assert_eq!(before - dropped, 20);
    assert_ne!(sched.thread_current(), selfish);

    // The feedback loop keeps penalizing it relative to its peers.
    for _ in 0..6000 {
        sched.thread_tick();
    }
    let peer = sched
        .thread_priority(sched.thread_current()) as i32;
    assert!(
        sched.thread_priority(selfish) as i32 <= peer,
        "nice thread outranked its peers"
    );
}

#[test]
fn mlfqs_nice_is_clamped() {
    let mut sched = mlfqs_sched();
    sched.thread_set_nice(99);
    assert_eq!(sched.thread_get_nice(), 20);
    sched.thread_set_nice(-99);
    assert_eq!(sched.thread_get_nice(), -20);
}

#[test]
fn mlfqs_recent_cpu_accrues_on_the_running_thread() {
    let mut sched = mlfqs_sched();
    assert_eq!(sched.thread_get_recent_cpu(), 0);
    for _ in 0..3 {
        sched.thread_tick();
    }
    assert_eq!(sched.thread_get_recent_cpu(), 300);
}
