// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scheduler Lock
//!
//! The single global lock serializing every thread-state and run-queue
//! mutation in the kernel. It is a spinlock that is reentrant by owner
//! core: a core that already holds it may take it again, and the lock is
//! only released once the matching number of guards has dropped. Local
//! interrupts are masked for the whole time the lock is held on the owning
//! core, so a nested interrupt handler can never deadlock against its own
//! core.
//!
//! Critical sections under this lock are kept to O(1) bounded work; every
//! cross-core consequence is deferred through `kernel::mp` rather than
//! waited on.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::kapi::types::CpuId;
use crate::kernel::arch;
use crate::kernel::arch::InterruptState;

/// Owner value while the lock is free.
const CORE_NONE: u32 = u32::MAX;

/// The global scheduler lock.
pub struct SchedulerLock {
    locked: AtomicBool,
    owner: AtomicU32,
    depth: AtomicU32,
}

impl SchedulerLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(CORE_NONE),
            depth: AtomicU32::new(0),
        }
    }

    /// Acquire the lock on behalf of the calling core.
    pub fn lock(&self) -> SchedulerLockGuard<'_> {
        self.lock_as(arch::current_cpu_num())
    }

    /// Acquire the lock on behalf of an explicit core. The caller must
    /// actually be executing on that core.
    pub fn lock_as(&self, core: CpuId) -> SchedulerLockGuard<'_> {
        let irq = arch::interrupts_save_disable();

        if self.owner.load(Ordering::Relaxed) == core {
            // Reentrant acquisition by the owning core.
            self.depth.fetch_add(1, Ordering::Relaxed);
            return SchedulerLockGuard { lock: self, irq };
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            arch::cpu_relax();
        }
        self.owner.store(core, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
        SchedulerLockGuard { lock: self, irq }
    }

    /// Check whether the calling core already holds the lock.
    pub fn held_by(&self, core: CpuId) -> bool {
        self.owner.load(Ordering::Relaxed) == core
    }

    /// Current recursion depth on the owning core.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Default for SchedulerLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one acquisition of the scheduler lock.
pub struct SchedulerLockGuard<'a> {
    lock: &'a SchedulerLock,
    irq: InterruptState,
}

impl<'a> SchedulerLockGuard<'a> {
    /// True when this guard is the outermost acquisition on its core.
    pub fn is_outermost(&self) -> bool {
        self.lock.depth.load(Ordering::Relaxed) == 1
    }
}

impl<'a> Drop for SchedulerLockGuard<'a> {
    fn drop(&mut self) {
        let depth = self.lock.depth.fetch_sub(1, Ordering::Relaxed);
        if depth == 0 {
            panic!("scheduler lock: unbalanced release");
        }
        if depth == 1 {
            self.lock.owner.store(CORE_NONE, Ordering::Relaxed);
            self.lock.locked.store(false, Ordering::Release);
        }
        arch::interrupts_restore(self.irq);
    }
}

// ============================================================================
// Tests
// ============================================================================
