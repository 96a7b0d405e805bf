// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Timeout Tests
//!
//! Timeout monotonicity across the blocking calls, and the race between
//! a timeout expiry and a concurrent wake resolving to a single winner.

use super::{fixture, settle, spawn, UADDR};
use crate::kapi::types::err::*;
use crate::kernel::object::handle::KObject;
use crate::kernel::sched::Outcome;
use crate::kernel::sync::address_arbiter::{ArbitrationType, SignalType};
use crate::kernel::syscalls::sync::*;
use crate::kernel::thread::ThreadState;
use crate::kernel::timer::ns_to_ticks;
use crate::kernel::usercopy::UserMemory;

const WAIT_EQ: u32 = ArbitrationType::WaitIfEqual as u32;
const SIG: u32 = SignalType::Signal as u32;

#[test]
fn wait_if_equal_times_out_no_earlier_than_deadline() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 5).unwrap());
    // No writer ever changes the value; 1ms timeout.
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 5, 1_000_000), Outcome::Parked);

    // Just short of the deadline: still waiting.
    k.advance_ticks(0, ns_to_ticks(1_000_000) - 1);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Waiting));

    // Crossing the deadline delivers the timeout.
    k.advance_ticks(0, 2);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Runnable));
    assert_eq!(k.wait_result(w), KX_ERR_TIMED_OUT);
}

#[test]
fn timed_out_thread_leaves_no_stale_tree_entry() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 5).unwrap());
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 5, 1_000_000), Outcome::Parked);
    k.advance_ticks(0, ns_to_ticks(2_000_000));

    k.with(|s| {
        assert!(s.arbiter.is_empty());
        assert!(s.timer.is_empty());
        assert_eq!(s.threads.t(w).state, ThreadState::Runnable);
    });

    // A late signal finds nobody.
    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG, 0, -1), KX_OK);
    assert_eq!(k.wait_result(w), KX_ERR_TIMED_OUT);
}

#[test]
fn signal_beats_timeout_and_expiry_is_noop() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 5).unwrap());
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 5, 1_000_000), Outcome::Parked);

    // The signal lands first and disarms the timer.
    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG, 0, 1), KX_OK);
    assert_eq!(k.wait_result(w), KX_OK);
    k.with(|s| assert!(s.timer.is_empty()));

    // The clock then passes the old deadline with no effect.
    k.advance_ticks(0, ns_to_ticks(5_000_000));
    assert_eq!(k.wait_result(w), KX_OK);
}

#[test]
fn condvar_wait_timeout_delivers_timed_out() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 0).unwrap());
    assert_eq!(
        sys_wait_process_wide_key_atomic(&k, 0, UADDR, 0x40, 7, 3_000_000),
        Outcome::Parked
    );
    k.advance_ticks(0, ns_to_ticks(3_000_000) + 1);
    k.with(|s| {
        assert_eq!(s.threads.t(w).state, ThreadState::Runnable);
        assert!(s.condvar.is_empty());
    });
    assert_eq!(k.wait_result(w), KX_ERR_TIMED_OUT);
}

#[test]
fn requeued_condvar_waiter_still_times_out() {
    let k = fixture();
    let holder = spawn(&k, 10, 0b0001, 0);
    let waiter = spawn(&k, 20, 0b0010, 1);
    settle(&k);
    let (hh, hw) = k.with(|s| {
        (
            s.handles.add(KObject::Thread(holder)),
            s.handles.add(KObject::Thread(waiter)),
        )
    });
    let key = 0x80u64;

    // The waiter parks with a finite timeout; the mutex then gets taken,
    // and the signal requeues the waiter behind the holder.
    k.with(|s| s.user.write32(UADDR, hw).unwrap());
    assert_eq!(
        sys_wait_process_wide_key_atomic(&k, 1, UADDR, key, hw, 4_000_000),
        Outcome::Parked
    );
    k.with(|s| s.user.write32(UADDR, hh).unwrap());
    sys_signal_process_wide_key(&k, 2, key, 1);
    k.with(|s| {
        assert_eq!(s.threads.t(waiter).state, ThreadState::Waiting);
        assert_eq!(s.threads.t(waiter).lock_owner, Some(holder));
    });

    // The timeout still applies while queued on the mutex.
    k.advance_ticks(0, ns_to_ticks(4_000_000) + 1);
    k.with(|s| {
        assert_eq!(s.threads.t(waiter).state, ThreadState::Runnable);
        assert_eq!(s.threads.t(waiter).lock_owner, None);
        // The old owner keeps no stale waiter reference.
        assert!(s.threads.t(holder).lock_waiters.is_empty());
    });
    assert_eq!(k.wait_result(waiter), KX_ERR_TIMED_OUT);
}

#[test]
fn wait_synchronization_tick_timeout() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    let h = k.with(|s| {
        let ev = s.create_event();
        [s.handles.add(KObject::Sync(ev))]
    });
    assert_eq!(sys_wait_synchronization(&k, 0, &h, 500), Outcome::Parked);
    k.advance_ticks(0, 499);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Waiting));
    k.advance_ticks(0, 1);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Runnable));
    assert_eq!(k.wait_result(w), KX_ERR_TIMED_OUT);
}
