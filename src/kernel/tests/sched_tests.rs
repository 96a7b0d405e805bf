// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scheduler Tests
//!
//! Pick-next ordering, strict priority preemption, round-robin yield,
//! affinity migration, suspension, termination, and the deferred
//! cross-core reschedule protocol.

use super::{fixture, settle, spawn};
use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::thread::ThreadState;

#[test]
fn highest_priority_runs_first() {
    let k = fixture();
    let low = spawn(&k, 40, CPU_MASK_ALL, 0);
    let high = spawn(&k, 10, CPU_MASK_ALL, 0);
    let mid = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);

    assert_eq!(k.current_thread(0), Some(high));
    k.with(|s| s.request_terminate(0, high).unwrap());
    assert_eq!(k.current_thread(0), Some(mid));
    k.with(|s| s.request_terminate(0, mid).unwrap());
    assert_eq!(k.current_thread(0), Some(low));
}

#[test]
fn wakeup_preempts_lower_priority_current() {
    let k = fixture();
    let low = spawn(&k, 40, CPU_MASK_ALL, 0);
    assert_eq!(k.current_thread(0), Some(low));

    // A higher-priority start on the same core preempts at the safe point.
    let high = spawn(&k, 10, CPU_MASK_ALL, 0);
    assert_eq!(k.current_thread(0), Some(high));

    // The preempted thread sits at the head of its level, still runnable.
    k.with(|s| {
        assert_eq!(s.threads.t(low).state, ThreadState::Runnable);
        assert_eq!(s.cores[0].run_queue.front(), Some(low));
    });
}

#[test]
fn equal_priority_does_not_preempt() {
    let k = fixture();
    let first = spawn(&k, 20, CPU_MASK_ALL, 0);
    let _second = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);
    assert_eq!(k.current_thread(0), Some(first));
}

#[test]
fn yield_rotates_within_level() {
    let k = fixture();
    let a = spawn(&k, 20, CPU_MASK_ALL, 0);
    let b = spawn(&k, 20, CPU_MASK_ALL, 0);
    let c = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);

    assert_eq!(k.current_thread(0), Some(a));
    k.with(|s| s.yield_thread(0).unwrap());
    assert_eq!(k.current_thread(0), Some(b));
    k.with(|s| s.yield_thread(0).unwrap());
    assert_eq!(k.current_thread(0), Some(c));
    k.with(|s| s.yield_thread(0).unwrap());
    assert_eq!(k.current_thread(0), Some(a));
}

#[test]
fn yield_does_not_cede_to_lower_priority() {
    let k = fixture();
    let high = spawn(&k, 10, CPU_MASK_ALL, 0);
    let _low = spawn(&k, 30, CPU_MASK_ALL, 0);
    settle(&k);

    assert_eq!(k.current_thread(0), Some(high));
    k.with(|s| s.yield_thread(0).unwrap());
    // Alone at its level, the yielder comes straight back.
    assert_eq!(k.current_thread(0), Some(high));
}

#[test]
fn affinity_restricts_placement() {
    let k = fixture();
    let t1 = spawn(&k, 20, 0b0010, 1);
    settle(&k);
    assert_eq!(k.current_thread(1), Some(t1));
    assert_eq!(k.current_thread(0), None);
}

#[test]
fn affinity_change_migrates_running_thread() {
    let k = fixture();
    let t = spawn(&k, 20, 0b0010, 1);
    settle(&k);
    assert_eq!(k.current_thread(1), Some(t));

    k.with(|s| s.set_affinity(1, t, 0b0001, 0).unwrap());
    assert_eq!(k.current_thread(1), None);
    settle(&k);
    assert_eq!(k.current_thread(0), Some(t));
}

#[test]
fn affinity_change_migrates_queued_thread() {
    let k = fixture();
    let runner = spawn(&k, 10, 0b0010, 1);
    let queued = spawn(&k, 20, 0b0010, 1);
    settle(&k);
    assert_eq!(k.current_thread(1), Some(runner));

    k.with(|s| s.set_affinity(0, queued, 0b0001, 0).unwrap());
    settle(&k);
    assert_eq!(k.current_thread(0), Some(queued));
}

#[test]
fn invalid_create_arguments_rejected() {
    let k = fixture();
    assert_eq!(k.create_thread(1, 64, CPU_MASK_ALL, 0), Err(KX_ERR_INVALID_ARGS));
    assert_eq!(k.create_thread(1, 10, 0, 0), Err(KX_ERR_INVALID_ARGS));
    assert_eq!(k.create_thread(1, 10, 0b0001, 2), Err(KX_ERR_INVALID_ARGS));
    assert_eq!(k.create_thread(1, 10, 0x10, 4), Err(KX_ERR_INVALID_ARGS));
}

#[test]
fn priority_change_requeues_atomically() {
    let k = fixture();
    let runner = spawn(&k, 10, CPU_MASK_ALL, 0);
    let waiter = spawn(&k, 30, CPU_MASK_ALL, 0);
    settle(&k);
    assert_eq!(k.current_thread(0), Some(runner));

    // Boosting the queued thread above the runner forces a switch.
    k.with(|s| {
        s.set_priority(0, waiter, 5).unwrap();
        assert_eq!(s.threads.t(waiter).queued_level, Some(5));
        s.preempt(0);
    });
    assert_eq!(k.current_thread(0), Some(waiter));
}

#[test]
fn deboosted_current_gets_preempted() {
    let k = fixture();
    let a = spawn(&k, 10, CPU_MASK_ALL, 0);
    let b = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);
    assert_eq!(k.current_thread(0), Some(a));

    k.with(|s| {
        s.set_priority(0, a, 30).unwrap();
        s.preempt(0);
    });
    assert_eq!(k.current_thread(0), Some(b));
}

#[test]
fn suspend_skips_thread_until_resume() {
    let k = fixture();
    let a = spawn(&k, 10, CPU_MASK_ALL, 0);
    let b = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);
    assert_eq!(k.current_thread(0), Some(a));

    k.with(|s| {
        s.suspend_thread(0, a).unwrap();
        s.preempt(0);
    });
    assert_eq!(k.current_thread(0), Some(b));
    k.with(|s| assert_eq!(s.threads.t(a).state, ThreadState::Runnable));

    // Nested suspends need matching resumes.
    k.with(|s| {
        s.suspend_thread(0, a).unwrap();
        s.resume_thread(0, a).unwrap();
        s.preempt(0);
    });
    assert_eq!(k.current_thread(0), Some(b));

    k.with(|s| {
        s.resume_thread(0, a).unwrap();
        s.preempt(0);
    });
    assert_eq!(k.current_thread(0), Some(a));

    k.with(|s| assert_eq!(s.resume_thread(0, a), Err(KX_ERR_BAD_STATE)));
}

#[test]
fn remote_wakeup_latches_ipi_until_safe_point() {
    let k = fixture();
    let low = spawn(&k, 40, 0b0010, 1);
    settle(&k);
    assert_eq!(k.current_thread(1), Some(low));

    // Core 1 enters a non-preemptible section; core 0 wakes a higher
    // priority thread onto it.
    k.with(|s| s.preempt_disable(1));
    let high = k.create_thread(1, 10, 0b0010, 1).unwrap();
    k.with(|s| s.start_thread(0, high).unwrap());

    k.with(|s| {
        assert!(s.cores[1].needs_reschedule);
        assert!(s.cores[1].ipi_pending);
        // The IPI arrives mid-section and stays latched.
        s.handle_reschedule_ipi(1);
    });
    assert_eq!(k.current_thread(1), Some(low));

    // Leaving the section honors the latched request.
    k.with(|s| s.preempt_enable(1));
    assert_eq!(k.current_thread(1), Some(high));
}

#[test]
fn terminate_unlinks_everything() {
    let k = fixture();
    let a = spawn(&k, 10, CPU_MASK_ALL, 0);
    let b = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);

    k.with(|s| {
        s.request_terminate(0, b).unwrap();
        assert_eq!(s.threads.t(b).state, ThreadState::Terminated);
        assert_eq!(s.threads.t(b).queued_level, None);
        s.request_terminate(0, a).unwrap();
    });
    assert_eq!(k.current_thread(0), None);

    k.with(|s| {
        s.close_thread(0, a).unwrap();
        s.close_thread(0, b).unwrap();
        assert!(s.threads.get(a).is_none());
        assert!(s.threads.get(b).is_none());
    });
}

#[test]
fn idle_core_counts_idle_transitions() {
    let k = fixture();
    let t = spawn(&k, 20, CPU_MASK_ALL, 0);
    settle(&k);
    k.with(|s| {
        s.request_terminate(0, t).unwrap();
        assert!(s.cores[0].idle_count > 0);
    });
}
