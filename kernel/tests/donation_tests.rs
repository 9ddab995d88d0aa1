//! Priority-donation tests: the forest operations directly, and the full
//! lock-chain scenario through the synchronization primitives.

use corvid_kernel::sched::{
    SchedConfig, Scheduler, DONATION_MAX_DEPTH, PRI_MIN,
};

fn sched() -> Scheduler {
    Scheduler::new(SchedConfig {
        mlfqs: false,
        max_threads: 64,
    })
}

// ===== Forest operations =====

#[test]
fn donation_propagates_along_a_chain_up_to_the_depth_bound() {
    let mut s = sched();

    // h[i] holds l[i]; h[i] (i > 0) is blocked on l[i-1]. The chain is
    // d -> l[16] -> h[16] -> l[15] -> ... -> l[0] -> h[0].
    let n = DONATION_MAX_DEPTH + 1;
    let holders: Vec<_> = (0..n)
        .map(|i| s.thread_create(&std::format!("h{}", i), 1).unwrap())
        .collect();
    let locks: Vec<_> = (0..n).map(|_| s.lock_create()).collect();

    for i in 0..n {
        s.donation_thread_acquire(holders[i], locks[i]);
    }
    for i in 1..n {
        s.donation_thread_block(holders[i], locks[i - 1]);
    }

    let donor = s.thread_create("donor", 60).unwrap();
    s.donation_thread_block(donor, locks[n - 1]);

    // Everything within 16 hops inherits the donor's priority...
    for i in 1..n {
        assert_eq!(s.thread_priority(holders[i]), 60, "holder {}", i);
    }
    // ...and the node one past the bound does not.
    assert_eq!(s.thread_priority(holders[0]), 1);
}

#[test]
fn release_restores_base_priority() {
    let mut s = sched();
    let t = s.thread_create("t", 5).unwrap();
    let l = s.lock_create();
    s.donation_thread_acquire(t, l);

    let d = s.thread_create("d", 50).unwrap();
    s.donation_thread_block(d, l);
    assert_eq!(s.thread_priority(t), 50);

    s.donation_thread_release(l);
    assert_eq!(s.thread_priority(t), 5);
    assert_eq!(s.donation_get_base_priority(t), 5);
}

#[test]
fn effective_priority_is_max_of_base_and_donors() {
    let mut s = sched();
    let t = s.thread_create("t", 40).unwrap();
    let l = s.lock_create();
    s.donation_thread_acquire(t, l);

    // A lower-priority donor does not lower the holder.
    let weak = s.thread_create("weak", 10).unwrap();
    s.donation_thread_block(weak, l);
    assert_eq!(s.thread_priority(t), 40);

    // Raising the base above every donation wins.
    s.donation_set_base_priority(t, 45);
    assert_eq!(s.thread_priority(t), 45);

    // Lowering it falls back to the best donor.
    let strong = s.thread_create("strong", 55).unwrap();
    s.donation_thread_block(strong, l);
    s.donation_set_base_priority(t, 3);
    assert_eq!(s.thread_priority(t), 55);
}

#[test]
fn unheld_lock_priority_follows_its_waiters() {
    let mut s = sched();
    let l = s.lock_create();
    assert_eq!(s.lock_priority(l), PRI_MIN);

    let a = s.thread_create("a", 12).unwrap();
    let b = s.thread_create("b", 34).unwrap();
    s.donation_thread_block(a, l);
    s.donation_thread_block(b, l);
    assert_eq!(s.lock_priority(l), 34);

    s.donation_thread_unblock(b);
    assert_eq!(s.lock_priority(l), 12);
    s.donation_thread_unblock(a);
    assert_eq!(s.lock_priority(l), PRI_MIN);
}

// ===== End-to-end through locks =====

/// The classic three-thread nested donation scenario: A=10 holds L1,
/// B=20 holds L2 and blocks on L1, C=30 blocks on L2.
#[test]
fn nested_donation_through_real_locks() {
    let mut s = sched();
    let l1 = s.lock_create();
    let l2 = s.lock_create();

    // Drop main below everyone so each new thread runs immediately.
    s.thread_set_priority(0);

    let a = s.thread_create("a", 10).unwrap();
    // A runs now.
    assert_eq!(s.thread_current(), a);
    s.lock_acquire(l1);

    let b = s.thread_create("b", 20).unwrap();
    // B preempts A and blocks on L1, donating 20.
    assert_eq!(s.thread_current(), b);
    s.lock_acquire(l2);
    s.lock_acquire(l1);

    // B is blocked; A runs with B's priority.
    assert_eq!(s.thread_current(), a);
    assert_eq!(s.thread_priority(a), 20);

    let c = s.thread_create("c", 30).unwrap();
    // C preempts and blocks on L2; the donation cascades C -> B -> A.
    assert_eq!(s.thread_current(), c);
    s.lock_acquire(l2);

    assert_eq!(s.thread_current(), a);
    assert_eq!(s.thread_priority(a), 30);
    assert_eq!(s.thread_priority(b), 30);

    // A releases L1: its donation evaporates, B takes over at 30.
    s.lock_release(l1);
    assert_eq!(s.thread_priority(a), 10);
    assert_eq!(s.thread_current(), b);
    assert_eq!(s.thread_priority(b), 30);

    // B releases L2: C runs; B falls back to its base of 20.
    s.lock_release(l2);
    assert_eq!(s.thread_current(), c);
    assert_eq!(s.thread_priority(b), 20);

    // Teardown in priority order: C, then B, then A.
    s.lock_release(l2);
    s.thread_exit();
    assert_eq!(s.thread_current(), b);
    s.lock_release(l1);
    s.thread_exit();
    assert_eq!(s.thread_current(), a);
    s.thread_exit();
    assert_eq!(s.thread_name(), "main");
}

#[test]
fn lock_handoff_wakes_the_highest_priority_waiter() {
    let mut s = sched();
    let l = s.lock_create();
    s.lock_acquire(l);

    let mid = s.thread_create("mid", 40).unwrap();
    assert_eq!(s.thread_current(), mid);
    s.lock_acquire(l);
    // mid blocked on l; main runs again (donated to 40).

    let high = s.thread_create("high", 50).unwrap();
    assert_eq!(s.thread_current(), high);
    s.lock_acquire(l);

    // Both blocked; main holds l with donations from both.
    assert_eq!(s.thread_name(), "main");
    assert_eq!(s.thread_get_priority(), 50);

    // Release hands the lock to high first, despite mid arriving first.
    s.lock_release(l);
    assert_eq!(s.thread_current(), high);
    assert!(s.lock_held_by_current(l));
    s.lock_release(l);
    s.thread_exit();

    assert_eq!(s.thread_current(), mid);
    assert!(s.lock_held_by_current(l));
    s.lock_release(l);
    s.thread_exit();

    assert_eq!(s.thread_name(), "main");
    assert_eq!(s.thread_get_priority(), 31);
}

#[test]
fn condition_signal_prefers_the_highest_priority_waiter() {
    let mut s = sched();
    let l = s.lock_create();
    let c = s.cond_create();

    s.thread_set_priority(1);

    let low = s.thread_create("low", 20).unwrap();
    assert_eq!(s.thread_current(), low);
    s.lock_acquire(l);
    s.cond_wait(c, l);
    // low sleeps; back on main.

    let high = s.thread_create("high", 30).unwrap();
    assert_eq!(s.thread_current(), high);
    s.lock_acquire(l);
    s.cond_wait(c, l);

    assert_eq!(s.thread_name(), "main");
    s.lock_acquire(l);
    s.cond_signal(c, l);
    s.lock_release(l);
    // high re-acquires and runs first.
    assert_eq!(s.thread_current(), high);
    s.lock_release(l);
    s.thread_exit();

    // low is still waiting for a signal.
    assert_eq!(s.thread_name(), "main");
    s.lock_acquire(l);
    s.cond_signal(c, l);
    s.lock_release(l);
    assert_eq!(s.thread_current(), low);
    s.lock_release(l);
    s.thread_exit();
    assert_eq!(s.thread_name(), "main");
}

#[test]
fn semaphore_hands_permits_by_priority() {
    let mut s = sched();
    let sema = s.sema_create(0);

    s.thread_set_priority(1);
    let low = s.thread_create("low", 10).unwrap();
    assert_eq!(s.thread_current(), low);
    s.sema_down(sema);
    let high = s.thread_create("high", 20).unwrap();
    assert_eq!(s.thread_current(), high);
    s.sema_down(sema);

    assert_eq!(s.thread_name(), "main");
    s.sema_up(sema);
    assert_eq!(s.thread_current(), high);
    s.thread_exit();

    assert_eq!(s.thread_name(), "main");
    s.sema_up(sema);
    assert_eq!(s.thread_current(), low);
    s.thread_exit();

    assert_eq!(s.thread_name(), "main");
    assert!(!s.sema_try_down(sema));
    s.sema_up(sema);
    assert!(s.sema_try_down(sema));
}
