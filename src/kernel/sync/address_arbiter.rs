// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Address Arbiter
//!
//! Futex-style waiting keyed by user virtual address. Waiters sit in one
//! tree ordered by (address, priority, arrival); the wait predicates read
//! the user value inside the scheduler lock's critical section, and the
//! signal-and-modify operations fold their read-modify-write of the user
//! word into the same section, so the observed value and the wake
//! decision can never be interleaved by a conflicting writer.
//!
//! Predicate failures report `KX_ERR_INVALID_STATE`; a user address that
//! faults reports `KX_ERR_INVALID_CURRENT_MEMORY` to the caller and
//! nothing else.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::{KernelState, Outcome};
use crate::kernel::thread::ArbWait;
use crate::kernel::timer::{timeout_from_ns, Timeout};
use crate::kernel::usercopy::UserMemory;
use alloc::collections::BTreeSet;

use crate::log_trace;

/// Wait predicates accepted by `wait_for_address`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationType {
    WaitIfLessThan = 0,
    DecrementAndWaitIfLessThan = 1,
    WaitIfEqual = 2,
    WaitIfEqual64 = 3,
}

impl ArbitrationType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::WaitIfLessThan),
            1 => Some(Self::DecrementAndWaitIfLessThan),
            2 => Some(Self::WaitIfEqual),
            3 => Some(Self::WaitIfEqual64),
            _ => None,
        }
    }
}

/// Signal flavors accepted by `signal_to_address`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Signal = 0,
    SignalAndIncrementIfEqual = 1,
    SignalAndModifyByWaitingCountIfEqual = 2,
}

impl SignalType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Signal),
            1 => Some(Self::SignalAndIncrementIfEqual),
            2 => Some(Self::SignalAndModifyByWaitingCountIfEqual),
            _ => None,
        }
    }
}

/// ============================================================================
/// Wait Tree
/// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ArbNode {
    addr: VAddr,
    prio: Priority,
    seq: u64,
    tid: Tid,
}

/// Address-keyed wait tree.
pub struct ArbiterTree {
    set: BTreeSet<ArbNode>,
}

impl ArbiterTree {
    pub(crate) fn new() -> Self {
        Self { set: BTreeSet::new() }
    }

    pub(crate) fn insert(&mut self, addr: VAddr, prio: Priority, seq: u64, tid: Tid) {
        self.set.insert(ArbNode { addr, prio, seq, tid });
    }

    pub(crate) fn remove(&mut self, addr: VAddr, prio: Priority, seq: u64, tid: Tid) -> bool {
        self.set.remove(&ArbNode { addr, prio, seq, tid })
    }

    fn first_for(&self, addr: VAddr) -> Option<ArbNode> {
        let node = self
            .set
            .range(ArbNode { addr, prio: 0, seq: 0, tid: 0 }..)
            .next()?;
        if node.addr == addr {
            Some(*node)
        } else {
            None
        }
    }

    /// Number of waiters parked on `addr`.
    pub fn waiting_on(&self, addr: VAddr) -> usize {
        self.set
            .range(ArbNode { addr, prio: 0, seq: 0, tid: 0 }..)
            .take_while(|n| n.addr == addr)
            .count()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// ============================================================================
/// Arbiter Operations
/// ============================================================================

impl KernelState {
    /// Atomic decrement-if-less-than on the user word, returning the
    /// value observed before any store. Atomicity comes from the
    /// scheduler lock and the masked interrupts underneath this call.
    fn user_decrement_if_less_than(&mut self, addr: VAddr, value: i32) -> Result<i32> {
        let observed = self.user.read32(addr)? as i32;
        if observed < value {
            self.user.write32(addr, observed.wrapping_sub(1) as u32)?;
        }
        Ok(observed)
    }

    /// Atomic compare-and-swap on the user word, returning the observed
    /// value.
    fn user_update_if_equal(&mut self, addr: VAddr, expected: i32, new_value: i32) -> Result<i32> {
        let observed = self.user.read32(addr)? as i32;
        if observed == expected {
            self.user.write32(addr, new_value as u32)?;
        }
        Ok(observed)
    }

    /// Park the current thread if the user word is less than `value`,
    /// optionally decrementing it as part of the same evaluation.
    pub fn arbiter_wait_if_less_than(
        &mut self,
        core: CpuId,
        addr: VAddr,
        value: i32,
        decrement: bool,
        timeout_ns: Nanoseconds,
    ) -> Outcome {
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }

        let observed = if decrement {
            self.user_decrement_if_less_than(addr, value)
        } else {
            self.user.read32(addr).map(|v| v as i32)
        };
        let observed = match observed {
            Ok(v) => v,
            Err(e) => return Outcome::Done(e),
        };
        if observed >= value {
            return Outcome::Done(KX_ERR_INVALID_STATE);
        }

        self.arbiter_park(core, curr, addr, timeout_ns)
    }

    /// Park the current thread if the 32-bit user word equals `value`.
    pub fn arbiter_wait_if_equal(&mut self, core: CpuId, addr: VAddr, value: i32, timeout_ns: Nanoseconds) -> Outcome {
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }

        let observed = match self.user.read32(addr) {
            Ok(v) => v as i32,
            Err(e) => return Outcome::Done(e),
        };
        if observed != value {
            return Outcome::Done(KX_ERR_INVALID_STATE);
        }

        self.arbiter_park(core, curr, addr, timeout_ns)
    }

    /// Park the current thread if the 64-bit user word equals `value`.
    pub fn arbiter_wait_if_equal64(&mut self, core: CpuId, addr: VAddr, value: i64, timeout_ns: Nanoseconds) -> Outcome {
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }

        let observed = match self.user.read64(addr) {
            Ok(v) => v as i64,
            Err(e) => return Outcome::Done(e),
        };
        if observed != value {
            return Outcome::Done(KX_ERR_INVALID_STATE);
        }

        self.arbiter_park(core, curr, addr, timeout_ns)
    }

    fn arbiter_park(&mut self, core: CpuId, curr: Tid, addr: VAddr, timeout_ns: Nanoseconds) -> Outcome {
        let timeout = timeout_from_ns(self.timer.now(), timeout_ns);
        if timeout == Timeout::Expired {
            return Outcome::Done(KX_ERR_TIMED_OUT);
        }

        let seq = self.next_wait_seq();
        let prio = {
            let t = self.threads.t_mut(curr);
            t.wait_seq = seq;
            t.arb_wait = Some(ArbWait { addr, prio: t.priority });
            t.priority
        };
        self.arbiter.insert(addr, prio, seq, curr);
        log_trace!("thread {} waits on arbiter addr {:#x}", curr, addr);
        self.block_current(core, timeout);
        Outcome::Parked
    }

    /// Wake up to `count` waiters on `addr` in (priority, arrival)
    /// order; `count` of zero or less wakes all.
    pub fn arbiter_signal(&mut self, acting: CpuId, addr: VAddr, count: i32) -> Status {
        self.arbiter_wake(acting, addr, count);
        KX_OK
    }

    /// Increment the user word if it equals `value`, then wake as
    /// `arbiter_signal`. A mismatched value wakes nobody.
    pub fn arbiter_signal_and_increment_if_equal(&mut self, acting: CpuId, addr: VAddr, value: i32, count: i32) -> Status {
        let observed = match self.user_update_if_equal(addr, value, value.wrapping_add(1)) {
            Ok(v) => v,
            Err(e) => return e,
        };
        if observed != value {
            return KX_ERR_INVALID_STATE;
        }
        self.arbiter_wake(acting, addr, count);
        KX_OK
    }

    /// Adjust the user word by the waiter population, then wake.
    ///
    /// The new value reflects what the wake will leave behind: +1 when no
    /// one is waiting, -1 when this wake drains every waiter, -2 for a
    /// wake-all with waiters present, unchanged when waiters remain.
    pub fn arbiter_signal_and_modify_by_waiting_count_if_equal(
        &mut self,
        acting: CpuId,
        addr: VAddr,
        value: i32,
        count: i32,
    ) -> Status {
        let waiting = self.arbiter.waiting_on(addr);
        let new_value = if count <= 0 {
            if waiting > 0 {
                value.wrapping_sub(2)
            } else {
                value.wrapping_add(1)
            }
        } else if waiting == 0 {
            value.wrapping_add(1)
        } else if waiting <= count as usize {
            value.wrapping_sub(1)
        } else {
            value
        };

        let observed = if new_value != value {
            self.user_update_if_equal(addr, value, new_value)
        } else {
            self.user.read32(addr).map(|v| v as i32)
        };
        let observed = match observed {
            Ok(v) => v,
            Err(e) => return e,
        };
        if observed != value {
            return KX_ERR_INVALID_STATE;
        }
        self.arbiter_wake(acting, addr, count);
        KX_OK
    }

    fn arbiter_wake(&mut self, acting: CpuId, addr: VAddr, count: i32) -> usize {
        let mut woken = 0;
        while count <= 0 || woken < count as usize {
            let node = match self.arbiter.first_for(addr) {
                Some(node) => node,
                None => break,
            };
            self.arbiter.remove(node.addr, node.prio, node.seq, node.tid);
            if let Some(t) = self.threads.get_mut(node.tid) {
                t.arb_wait = None;
            }
            self.make_runnable(acting, node.tid, KX_OK);
            woken += 1;
        }
        if woken > 0 {
            log_trace!("arbiter addr {:#x}: woke {}", addr, woken);
        }
        woken
    }
}

// ============================================================================
// Tests
// ============================================================================
