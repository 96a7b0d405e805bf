// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Address Arbiter Tests
//!
//! The three wait predicates, the signal flavors with their atomic
//! user-word updates, and the ordering guarantees over one address.

use super::{fixture, settle, spawn, UADDR};
use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::Outcome;
use crate::kernel::sync::address_arbiter::{ArbitrationType, SignalType};
use crate::kernel::syscalls::sync::*;
use crate::kernel::thread::ThreadState;
use crate::kernel::usercopy::UserMemory;

const WAIT_LT: u32 = ArbitrationType::WaitIfLessThan as u32;
const WAIT_DEC_LT: u32 = ArbitrationType::DecrementAndWaitIfLessThan as u32;
const WAIT_EQ: u32 = ArbitrationType::WaitIfEqual as u32;
const WAIT_EQ64: u32 = ArbitrationType::WaitIfEqual64 as u32;
const SIG: u32 = SignalType::Signal as u32;
const SIG_INC: u32 = SignalType::SignalAndIncrementIfEqual as u32;
const SIG_MOD: u32 = SignalType::SignalAndModifyByWaitingCountIfEqual as u32;

#[test]
fn wait_if_equal_predicate() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 5).unwrap());
    // Mismatch fails fast without blocking.
    assert_eq!(
        sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 4, -1),
        Outcome::Done(KX_ERR_INVALID_STATE)
    );
    // Match parks.
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 5, -1), Outcome::Parked);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Waiting));

    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG, 0, 1), KX_OK);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Runnable));
    assert_eq!(k.wait_result(w), KX_OK);
}

#[test]
fn wait_if_equal64_reads_wide() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| {
        s.user.write32(UADDR + 0x10, 0x9999_9999).unwrap();
        s.user.write32(UADDR + 0x14, 0x1).unwrap();
    });
    let wide: i64 = 0x1_9999_9999;
    assert_eq!(
        sys_wait_for_address(&k, 0, UADDR + 0x10, WAIT_EQ64, wide + 1, -1),
        Outcome::Done(KX_ERR_INVALID_STATE)
    );
    assert_eq!(sys_wait_for_address(&k, 0, UADDR + 0x10, WAIT_EQ64, wide, -1), Outcome::Parked);
    k.with(|s| assert_eq!(s.threads.t(w).state, ThreadState::Waiting));
}

#[test]
fn decrement_and_wait_updates_value() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 3).unwrap());
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_DEC_LT, 5, -1), Outcome::Parked);
    k.with(|s| {
        assert_eq!(s.user.read32(UADDR).unwrap(), 2);
        assert_eq!(s.threads.t(w).state, ThreadState::Waiting);
    });
}

#[test]
fn decrement_skipped_when_not_less() {
    let k = fixture();
    spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 7).unwrap());
    assert_eq!(
        sys_wait_for_address(&k, 0, UADDR, WAIT_DEC_LT, 5, -1),
        Outcome::Done(KX_ERR_INVALID_STATE)
    );
    k.with(|s| assert_eq!(s.user.read32(UADDR).unwrap(), 7));
}

#[test]
fn signal_wakes_in_priority_order() {
    let k = fixture();
    let t30 = spawn(&k, 30, 0b0001, 0);
    let t10 = spawn(&k, 10, 0b0010, 1);
    let t20 = spawn(&k, 20, 0b0100, 2);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 0).unwrap());
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_LT, 1, -1), Outcome::Parked);
    assert_eq!(sys_wait_for_address(&k, 1, UADDR, WAIT_LT, 1, -1), Outcome::Parked);
    assert_eq!(sys_wait_for_address(&k, 2, UADDR, WAIT_LT, 1, -1), Outcome::Parked);

    // One at a time: 10, then 20, then 30.
    assert_eq!(sys_signal_to_address(&k, 3, UADDR, SIG, 0, 1), KX_OK);
    k.with(|s| {
        assert_eq!(s.threads.t(t10).state, ThreadState::Runnable);
        assert_eq!(s.threads.t(t20).state, ThreadState::Waiting);
    });
    assert_eq!(sys_signal_to_address(&k, 3, UADDR, SIG, 0, 1), KX_OK);
    k.with(|s| {
        assert_eq!(s.threads.t(t20).state, ThreadState::Runnable);
        assert_eq!(s.threads.t(t30).state, ThreadState::Waiting);
    });
    // Wake-all drains the rest.
    assert_eq!(sys_signal_to_address(&k, 3, UADDR, SIG, 0, -1), KX_OK);
    k.with(|s| {
        assert_eq!(s.threads.t(t30).state, ThreadState::Runnable);
        assert!(s.arbiter.is_empty());
    });
}

#[test]
fn signal_and_increment_if_equal() {
    let k = fixture();
    let w = spawn(&k, 20, 0b0001, 0);
    settle(&k);

    k.with(|s| s.user.write32(UADDR, 5).unwrap());
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 5, -1), Outcome::Parked);

    // Wrong expected value: no update, no wake.
    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG_INC, 4, 1), KX_ERR_INVALID_STATE);
    k.with(|s| {
        assert_eq!(s.user.read32(UADDR).unwrap(), 5);
        assert_eq!(s.threads.t(w).state, ThreadState::Waiting);
    });

    // Matching value: increment and wake in one critical section.
    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG_INC, 5, 1), KX_OK);
    k.with(|s| {
        assert_eq!(s.user.read32(UADDR).unwrap(), 6);
        assert_eq!(s.threads.t(w).state, ThreadState::Runnable);
    });
}

#[test]
fn signal_and_modify_by_waiting_count() {
    let k = fixture();

    // No waiters: the word is incremented.
    let a = spawn(&k, 20, 0b0001, 0);
    settle(&k);
    k.with(|s| s.user.write32(UADDR, 10).unwrap());
    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG_MOD, 10, 1), KX_OK);
    k.with(|s| assert_eq!(s.user.read32(UADDR).unwrap(), 11));

    // One waiter, wake count covers it: the word is decremented.
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 11, -1), Outcome::Parked);
    assert_eq!(sys_signal_to_address(&k, 1, UADDR, SIG_MOD, 11, 1), KX_OK);
    k.with(|s| {
        assert_eq!(s.user.read32(UADDR).unwrap(), 10);
        assert_eq!(s.threads.t(a).state, ThreadState::Runnable);
    });

    // Two waiters, wake count one: the word is left unchanged.
    let b = spawn(&k, 25, 0b0010, 1);
    settle(&k);
    k.with(|s| s.preempt(0));
    assert_eq!(sys_wait_for_address(&k, 0, UADDR, WAIT_EQ, 10, -1), Outcome::Parked);
    assert_eq!(sys_wait_for_address(&k, 1, UADDR, WAIT_EQ, 10, -1), Outcome::Parked);
    assert_eq!(sys_signal_to_address(&k, 2, UADDR, SIG_MOD, 10, 1), KX_OK);
    k.with(|s| {
        assert_eq!(s.user.read32(UADDR).unwrap(), 10);
        assert_eq!(s.threads.t(a).state, ThreadState::Runnable);
        assert_eq!(s.threads.t(b).state, ThreadState::Waiting);
    });

    // Wake-all with a waiter present: the word drops by two.
    assert_eq!(sys_signal_to_address(&k, 2, UADDR, SIG_MOD, 10, -1), KX_OK);
    k.with(|s| {
        assert_eq!(s.user.read32(UADDR).unwrap(), 8);
        assert_eq!(s.threads.t(b).state, ThreadState::Runnable);
    });

    // Stale expected value: nothing happens.
    assert_eq!(sys_signal_to_address(&k, 2, UADDR, SIG_MOD, 10, 1), KX_ERR_INVALID_STATE);
}

#[test]
fn misaligned_and_kernel_addresses_fail_fast() {
    let k = fixture();
    spawn(&k, 20, 0b0001, 0);
    assert_eq!(
        sys_wait_for_address(&k, 0, UADDR + 1, WAIT_EQ, 0, -1),
        Outcome::Done(KX_ERR_INVALID_ADDRESS)
    );
    assert_eq!(
        sys_wait_for_address(&k, 0, UADDR + 4, WAIT_EQ64, 0, -1),
        Outcome::Done(KX_ERR_INVALID_ADDRESS)
    );
    assert_eq!(
        sys_wait_for_address(&k, 0, USER_ADDRESS_TOP + 8, WAIT_EQ, 0, -1),
        Outcome::Done(KX_ERR_INVALID_ADDRESS)
    );
    assert_eq!(sys_signal_to_address(&k, 0, UADDR + 2, SIG, 0, 1), KX_ERR_INVALID_ADDRESS);
    assert_eq!(
        sys_wait_for_address(&k, 0, UADDR, 99, 0, -1),
        Outcome::Done(KX_ERR_OUT_OF_RANGE)
    );
    assert_eq!(sys_signal_to_address(&k, 0, UADDR, 99, 0, 1), KX_ERR_OUT_OF_RANGE);
}
