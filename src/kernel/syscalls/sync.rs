// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization System Calls
//!
//! Entry points for the user mutex, the process-wide condition variable,
//! the address arbiter, and multi-object waits. Timeouts cross this
//! boundary in nanoseconds (negative means infinite, zero means already
//! expired) except `sys_wait_synchronization`, which takes kernel ticks.
//!
//! Calls that park return `Outcome::Parked`; the final status reaches the
//! thread through its wait result when it next runs, the same way the
//! exception-return glue would materialize it into a register.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::{Kernel, Outcome};
use crate::kernel::sync::address_arbiter::{ArbitrationType, SignalType};
use crate::kernel::timer::Timeout;
use crate::kernel::usercopy::validate_user_address;

use crate::log_debug;

/// Park behind the user mutex at `address` while it reads
/// `owner_handle | wait flag`.
pub fn sys_arbitrate_lock(k: &Kernel, core: CpuId, owner_handle: Handle, address: VAddr, tag: u32) -> Outcome {
    if let Err(e) = validate_user_address(address, 4) {
        return Outcome::Done(e);
    }
    log_debug!("sys_arbitrate_lock: owner={:#x} addr={:#x} tag={:#x}", owner_handle, address, tag);
    k.with(|s| {
        let out = s.arbitrate_lock(core, owner_handle, address, tag);
        s.preempt(core);
        out
    })
}

/// Release the user mutex at `address`, handing it to the best waiter.
pub fn sys_arbitrate_unlock(k: &Kernel, core: CpuId, address: VAddr) -> Status {
    if let Err(e) = validate_user_address(address, 4) {
        return e;
    }
    log_debug!("sys_arbitrate_unlock: addr={:#x}", address);
    k.with(|s| {
        let ret = s.arbitrate_unlock(core, address);
        s.preempt(core);
        ret
    })
}

/// Atomically release the user mutex at `address` and wait under
/// `cv_key`; re-acquires the mutex before the wait completes.
pub fn sys_wait_process_wide_key_atomic(
    k: &Kernel,
    core: CpuId,
    address: VAddr,
    cv_key: u64,
    tag: u32,
    timeout_ns: Nanoseconds,
) -> Outcome {
    if let Err(e) = validate_user_address(address, 4) {
        return Outcome::Done(e);
    }
    let cv_key = cv_key & !3;
    log_debug!("sys_wait_process_wide_key_atomic: addr={:#x} key={:#x} timeout={}", address, cv_key, timeout_ns);
    k.with(|s| {
        let out = s.condvar_wait(core, address, cv_key, tag, timeout_ns);
        s.preempt(core);
        out
    })
}

/// Wake up to `count` waiters under `cv_key`; `count` of zero or less
/// wakes all. Best effort, never fails.
pub fn sys_signal_process_wide_key(k: &Kernel, core: CpuId, cv_key: u64, count: i32) {
    let cv_key = cv_key & !3;
    log_debug!("sys_signal_process_wide_key: key={:#x} count={}", cv_key, count);
    k.with(|s| {
        s.condvar_signal(core, cv_key, count);
        s.preempt(core);
    })
}

/// Wait on `address` under one of the arbitration predicates.
pub fn sys_wait_for_address(
    k: &Kernel,
    core: CpuId,
    address: VAddr,
    arb_type: u32,
    value: i64,
    timeout_ns: Nanoseconds,
) -> Outcome {
    let arb = match ArbitrationType::from_u32(arb_type) {
        Some(arb) => arb,
        None => return Outcome::Done(KX_ERR_OUT_OF_RANGE),
    };
    let align = if arb == ArbitrationType::WaitIfEqual64 { 8 } else { 4 };
    if let Err(e) = validate_user_address(address, align) {
        return Outcome::Done(e);
    }
    log_debug!("sys_wait_for_address: addr={:#x} type={:?} value={} timeout={}", address, arb, value, timeout_ns);
    k.with(|s| {
        let out = match arb {
            ArbitrationType::WaitIfLessThan => s.arbiter_wait_if_less_than(core, address, value as i32, false, timeout_ns),
            ArbitrationType::DecrementAndWaitIfLessThan => {
                s.arbiter_wait_if_less_than(core, address, value as i32, true, timeout_ns)
            }
            ArbitrationType::WaitIfEqual => s.arbiter_wait_if_equal(core, address, value as i32, timeout_ns),
            ArbitrationType::WaitIfEqual64 => s.arbiter_wait_if_equal64(core, address, value, timeout_ns),
        };
        s.preempt(core);
        out
    })
}

/// Wake waiters on `address`, optionally updating the user word in the
/// same critical section.
pub fn sys_signal_to_address(
    k: &Kernel,
    core: CpuId,
    address: VAddr,
    signal_type: u32,
    value: i32,
    count: i32,
) -> Status {
    let sig = match SignalType::from_u32(signal_type) {
        Some(sig) => sig,
        None => return KX_ERR_OUT_OF_RANGE,
    };
    if let Err(e) = validate_user_address(address, 4) {
        return e;
    }
    log_debug!("sys_signal_to_address: addr={:#x} type={:?} value={} count={}", address, sig, value, count);
    k.with(|s| {
        let ret = match sig {
            SignalType::Signal => s.arbiter_signal(core, address, count),
            SignalType::SignalAndIncrementIfEqual => {
                s.arbiter_signal_and_increment_if_equal(core, address, value, count)
            }
            SignalType::SignalAndModifyByWaitingCountIfEqual => {
                s.arbiter_signal_and_modify_by_waiting_count_if_equal(core, address, value, count)
            }
        };
        s.preempt(core);
        ret
    })
}

/// Wait until one of `handles` is signaled; `timeout_ticks` counts the
/// hardware timer (negative means infinite). A non-negative `Done` value
/// is the signaled handle's index.
pub fn sys_wait_synchronization(k: &Kernel, core: CpuId, handles: &[Handle], timeout_ticks: i64) -> Outcome {
    if handles.len() > MAX_WAIT_OBJECTS {
        return Outcome::Done(KX_ERR_OUT_OF_RANGE);
    }
    log_debug!("sys_wait_synchronization: {} handles timeout={}", handles.len(), timeout_ticks);
    k.with(|s| {
        let mut objects = alloc::vec::Vec::with_capacity(handles.len());
        for &h in handles {
            match s.handles.get_sync(h) {
                Some(oid) => objects.push(oid),
                None => return Outcome::Done(KX_ERR_BAD_HANDLE),
            }
        }
        let timeout = if timeout_ticks < 0 {
            Timeout::Infinite
        } else if timeout_ticks == 0 {
            Timeout::Expired
        } else {
            Timeout::Deadline(s.timer.now().saturating_add(timeout_ticks as Tick))
        };
        let out = s.wait_synchronization(core, &objects, timeout);
        s.preempt(core);
        out
    })
}

/// Deliver `KX_ERR_CANCELED` to a thread parked in a multi-object wait.
pub fn sys_cancel_synchronization(k: &Kernel, core: CpuId, thread_handle: Handle) -> Status {
    k.with(|s| {
        let tid = match s.handles.get_thread(thread_handle) {
            Some(tid) => tid,
            None => return KX_ERR_BAD_HANDLE,
        };
        let ret = match s.cancel_synchronization(core, tid) {
            Ok(()) => KX_OK,
            Err(e) => e,
        };
        s.preempt(core);
        ret
    })
}
