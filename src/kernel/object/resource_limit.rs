// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Resource Limits
//!
//! Per-kind accounting of (limit, current, peak, hint) with a gate:
//! a reservation that would exceed the limit parks the caller until a
//! release frees capacity or the timeout passes. Waiters are satisfied in
//! (priority, arrival) order, each re-checked against the capacity
//! actually available when it is considered.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::{KernelState, Outcome};
use crate::kernel::timer::{timeout_from_ns, Timeout};
use alloc::vec::Vec;

use crate::log_trace;

/// Resource kinds tracked by the kernel.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Threads = 0,
    Events = 1,
    Handles = 2,
    Sessions = 3,
    Memory = 4,
}

/// Number of tracked kinds.
pub const RESOURCE_KIND_COUNT: usize = 5;

/// Resource-limit accounting block.
pub struct ResourceLimit {
    limits: [i64; RESOURCE_KIND_COUNT],
    currents: [i64; RESOURCE_KIND_COUNT],
    peaks: [i64; RESOURCE_KIND_COUNT],
    /// Threads parked until capacity frees up, in (priority, arrival) order
    pub(crate) waiters: Vec<Tid>,
}

impl ResourceLimit {
    pub(crate) fn new() -> Self {
        Self {
            limits: [i64::MAX; RESOURCE_KIND_COUNT],
            currents: [0; RESOURCE_KIND_COUNT],
            peaks: [0; RESOURCE_KIND_COUNT],
            waiters: Vec::new(),
        }
    }

    pub fn limit(&self, kind: ResourceKind) -> i64 {
        self.limits[kind as usize]
    }

    pub fn current(&self, kind: ResourceKind) -> i64 {
        self.currents[kind as usize]
    }

    pub fn peak(&self, kind: ResourceKind) -> i64 {
        self.peaks[kind as usize]
    }

    /// Best-effort remaining capacity.
    pub fn hint(&self, kind: ResourceKind) -> i64 {
        self.limits[kind as usize].saturating_sub(self.currents[kind as usize])
    }

    /// Commit `amount` if it fits.
    pub(crate) fn try_charge(&mut self, kind: ResourceKind, amount: i64) -> bool {
        let k = kind as usize;
        if self.currents[k].saturating_add(amount) > self.limits[k] {
            return false;
        }
        self.currents[k] += amount;
        self.peaks[k] = self.peaks[k].max(self.currents[k]);
        true
    }

    fn uncharge(&mut self, kind: ResourceKind, amount: i64) {
        let k = kind as usize;
        if self.currents[k] < amount {
            panic!("resource limit: release below zero for kind {:?}", kind);
        }
        self.currents[k] -= amount;
    }
}

impl KernelState {
    /// Set a kind's limit. Refuses to drop below what is already in use.
    pub fn resource_set_limit(&mut self, acting: CpuId, kind: ResourceKind, limit: i64) -> Result {
        if limit < 0 {
            return Err(KX_ERR_INVALID_ARGS);
        }
        if limit < self.resource_limit.current(kind) {
            return Err(KX_ERR_INVALID_STATE);
        }
        self.resource_limit.limits[kind as usize] = limit;
        // A raised limit may unblock parked reservations.
        self.resource_wake_fitting(acting);
        Ok(())
    }

    /// Reserve `amount` of `kind` on behalf of the current thread,
    /// parking at the gate until capacity frees up or the timeout passes
    /// (`KX_ERR_OUT_OF_RESOURCE` on a final miss).
    pub fn resource_reserve(&mut self, core: CpuId, kind: ResourceKind, amount: i64, timeout_ns: Nanoseconds) -> Outcome {
        if amount <= 0 {
            return Outcome::Done(KX_ERR_INVALID_ARGS);
        }
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }
        if self.resource_limit.try_charge(kind, amount) {
            return Outcome::Done(KX_OK);
        }
        let timeout = timeout_from_ns(self.timer.now(), timeout_ns);
        if timeout == Timeout::Expired {
            return Outcome::Done(KX_ERR_OUT_OF_RESOURCE);
        }

        let seq = self.next_wait_seq();
        {
            let t = self.threads.t_mut(curr);
            t.wait_seq = seq;
            t.pending_reserve = Some((kind, amount));
        }
        {
            let st = &mut *self;
            let prio = st.threads.t(curr).priority;
            let pos = st
                .resource_limit
                .waiters
                .iter()
                .position(|&w| {
                    let t = st.threads.t(w);
                    (t.priority, t.wait_seq) > (prio, seq)
                })
                .unwrap_or(st.resource_limit.waiters.len());
            st.resource_limit.waiters.insert(pos, curr);
        }
        log_trace!("thread {} gated on {:?} x{}", curr, kind, amount);
        self.block_current(core, timeout);
        Outcome::Parked
    }

    /// Return `amount` of `kind` and satisfy as many parked reservations
    /// as now fit, in order.
    pub fn resource_release(&mut self, acting: CpuId, kind: ResourceKind, amount: i64) {
        self.resource_limit.uncharge(kind, amount);
        self.resource_wake_fitting(acting);
    }

    fn resource_wake_fitting(&mut self, acting: CpuId) {
        let candidates = self.resource_limit.waiters.clone();
        for w in candidates {
            let (kind, amount) = match self.threads.get(w).and_then(|t| t.pending_reserve) {
                Some(r) => r,
                None => continue,
            };
            if self.resource_limit.try_charge(kind, amount) {
                self.threads.t_mut(w).pending_reserve = None;
                self.resource_limit.waiters.retain(|&x| x != w);
                self.make_runnable(acting, w, KX_OK);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
