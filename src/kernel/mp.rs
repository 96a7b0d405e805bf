// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-Core Coordination
//!
//! This module implements the deferred rescheduling protocol between
//! cores. A scheduling change made on core A never blocks on core B:
//! A marks B's needs-reschedule flag under the scheduler lock, latches a
//! reschedule IPI, and moves on. B acts at its own next safe point
//! (exception return, interrupt return, or an explicit check), and a core
//! sitting in a preemption-disabled section keeps the request latched
//! until that section ends.
//!
//! # Usage
//!
//! ```text
//! // From the wake path, after putting a thread on core 2's queue:
//! state.request_reschedule(acting_core, 2);
//!
//! // From core 2's interrupt glue:
//! kernel.with(|s| s.handle_reschedule_ipi(2));
//! ```

use crate::kapi::types::*;
use crate::kernel::arch;
use crate::kernel::sched::KernelState;

use crate::log_trace;

/// Convert a core number to an affinity-mask bit.
pub const fn cpu_num_to_mask(cpu: CpuId) -> CpuMask {
    1 << cpu as u64
}

impl KernelState {
    /// Note that `target` should re-evaluate its scheduling decision.
    ///
    /// For a remote core this latches an IPI (at most one outstanding per
    /// core) so the target leaves idle or a low-priority thread promptly;
    /// the caller never waits for the target to acknowledge.
    pub(crate) fn request_reschedule(&mut self, acting: CpuId, target: CpuId) {
        let pc = &mut self.cores[target as usize];
        pc.needs_reschedule = true;
        if target != acting && !pc.ipi_pending {
            pc.ipi_pending = true;
            log_trace!("core {} -> reschedule ipi -> core {}", acting, target);
            arch::send_reschedule_ipi(target);
        }
    }

    /// Reschedule-IPI entry point, called from the target core's
    /// interrupt glue. If the core is in a non-preemptible section the
    /// request stays latched and is honored at `preempt_enable`.
    pub fn handle_reschedule_ipi(&mut self, core: CpuId) {
        self.preempt(core);
    }

    /// Mask of cores with a pending reschedule.
    pub fn pending_reschedule_mask(&self) -> CpuMask {
        let mut mask = 0;
        for core in 0..MAX_CORES {
            if self.cores[core].needs_reschedule {
                mask |= cpu_num_to_mask(core as CpuId);
            }
        }
        mask
    }
}

// ============================================================================
// Tests
// ============================================================================
