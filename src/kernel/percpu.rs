// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-Core Data
//!
//! This module provides the per-core block for the Kestrel kernel: the
//! current thread, the core's run queue, the deferred-reschedule flag, the
//! latched reschedule IPI, and the preemption-disable depth. All fields
//! are mutated only under the global scheduler lock; cross-core visibility
//! comes from the lock, not from per-field atomics.

use crate::kapi::types::*;
use crate::kernel::sched::run_queue::RunQueue;

/// Per-core scheduling block.
pub struct PerCore {
    /// Core ID
    pub id: CpuId,

    /// Thread currently executing on this core; None while idle
    pub current: Option<Tid>,

    /// Ready threads allowed on this core
    pub run_queue: RunQueue,

    /// A scheduling decision changed what this core should run; acted on
    /// at the core's next safe point
    pub needs_reschedule: bool,

    /// A reschedule IPI was sent to this core and has not been consumed
    pub ipi_pending: bool,

    /// Preemption-disable nesting depth; while nonzero, pending
    /// reschedules stay latched
    pub preempt_disable: u32,

    /// Times this core went idle
    pub idle_count: u64,
}

impl PerCore {
    pub(crate) const fn new(id: CpuId) -> Self {
        Self {
            id,
            current: None,
            run_queue: RunQueue::new(id),
            needs_reschedule: false,
            ipi_pending: false,
            preempt_disable: 0,
            idle_count: 0,
        }
    }

    /// Check if this core may switch threads right now.
    pub fn preemptible(&self) -> bool {
        self.preempt_disable == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_core_is_idle() {
        let core = PerCore::new(2);
        assert_eq!(core.id, 2);
        assert!(core.current.is_none());
        assert!(core.run_queue.is_empty());
        assert!(core.preemptible());
    }
}
