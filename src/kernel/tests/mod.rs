// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Scenario Tests
//!
//! End-to-end exercises of the scheduling core: each test builds a
//! kernel, drives threads through the public entry points, and observes
//! wake order and results through the per-core current-thread state.

pub mod arbiter_tests;
pub mod sched_tests;
pub mod timer_tests;

use crate::kapi::types::*;
use crate::kernel::sched::Kernel;

/// User page mapped by every fixture.
pub const UADDR: VAddr = 0x10_000;

/// Kernel with one mapped user page.
pub fn fixture() -> Kernel {
    let k = Kernel::new();
    k.with(|s| s.user.map(UADDR, 0x1000));
    k
}

/// Create and start a thread, without driving any core's safe point.
pub fn spawn(k: &Kernel, prio: Priority, mask: CpuMask, ideal: CpuId) -> Tid {
    let tid = k.create_thread(1, prio, mask, ideal).unwrap();
    k.start_thread(ideal, tid).unwrap();
    tid
}

/// Run every core's pending reschedule.
pub fn settle(k: &Kernel) {
    k.with(|s| {
        for core in 0..MAX_CORES {
            s.preempt(core as CpuId);
        }
    });
}
