// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Light Lock
//!
//! A two-state mutex in a single tagged word: 0 when free, otherwise the
//! owner TID shifted up one with the low bit flagging parked waiters.
//! Both fast paths are one compare-and-swap and never touch the scheduler
//! lock. The slow paths park through the owner thread's waiter list,
//! which is also the source set for priority inheritance: the owner runs
//! at least as urgently as its best waiter until it unlocks.
//!
//! Ownership hands off directly on contended unlock; the word never reads
//! free in between, so a third thread probing the fast path cannot steal
//! the lock past the queue.
//!
//! Inheritance is one level deep. A boosted owner that is itself parked
//! on another lock does not forward the boost.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::{Kernel, KernelState, Outcome};
use crate::kernel::thread::ThreadState;
use crate::kernel::timer::Timeout;

use crate::log_trace;

/// Low bit of the tag word: at least one thread is parked on this lock.
const TAG_WAITERS: u64 = 1;

/// A light lock.
pub struct LightLock {
    tag: AtomicU64,
}

impl LightLock {
    pub const fn new() -> Self {
        Self { tag: AtomicU64::new(0) }
    }

    /// Address identity of this lock; the key its waiters park under.
    fn key(&self) -> VAddr {
        self as *const LightLock as VAddr
    }

    /// One-shot lock-free acquisition attempt.
    pub fn try_lock(&self, tid: Tid) -> bool {
        self.tag
            .compare_exchange(0, tid << 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.tag.load(Ordering::Relaxed) != 0
    }

    /// Owner TID, if held.
    pub fn owner(&self) -> Option<Tid> {
        match self.tag.load(Ordering::Relaxed) {
            0 => None,
            tag => Some(tag >> 1),
        }
    }

    /// Whether the waiters flag is set.
    pub fn has_waiters(&self) -> bool {
        self.tag.load(Ordering::Relaxed) & TAG_WAITERS != 0
    }

    /// Acquire the lock as `tid`, the current thread of `core`.
    pub fn lock(&self, kernel: &Kernel, core: CpuId, tid: Tid) -> Outcome {
        if self.try_lock(tid) {
            return Outcome::Done(KX_OK);
        }
        kernel.with(|s| s.light_lock_slow(core, self))
    }

    /// Release the lock as `tid`.
    pub fn unlock(&self, kernel: &Kernel, core: CpuId, tid: Tid) {
        if self
            .tag
            .compare_exchange(tid << 1, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        kernel.with(|s| {
            s.light_unlock_slow(core, self);
            s.preempt(core);
        });
    }
}

impl Default for LightLock {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelState {
    /// Contended acquire: register as a waiter on the owner, boost it,
    /// park. Ownership arrives via direct handoff in the unlock path.
    pub fn light_lock_slow(&mut self, core: CpuId, lock: &LightLock) -> Outcome {
        let curr = self.current_tid(core);
        loop {
            let tag = lock.tag.load(Ordering::Acquire);

            if tag == 0 {
                // Freed since the fast path failed.
                if lock
                    .tag
                    .compare_exchange(0, curr << 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Outcome::Done(KX_OK);
                }
                continue;
            }

            let owner = tag >> 1;
            if owner == curr {
                panic!("light lock: thread {} locking a lock it owns", curr);
            }

            // Publish the waiters flag before parking; the owner's fast
            // unlock must fail from here on.
            if tag & TAG_WAITERS == 0
                && lock
                    .tag
                    .compare_exchange(tag, tag | TAG_WAITERS, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }

            if self.threads.t(curr).is_termination_requested() {
                return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
            }
            match self.threads.get(owner) {
                Some(o) if o.state != ThreadState::Terminated => {}
                // The owner died holding the lock; no release is coming.
                _ => return Outcome::Done(KX_ERR_CANCELED),
            }

            log_trace!("thread {} blocks on light lock held by {}", curr, owner);
            self.add_lock_waiter(owner, curr, lock.key(), 0);
            self.block_current(core, Timeout::Infinite);
            return Outcome::Parked;
        }
    }

    /// Contended release: hand the lock to the best waiter and drop back
    /// to base priority (or to the best waiter on any lock still held).
    pub fn light_unlock_slow(&mut self, core: CpuId, lock: &LightLock) {
        let curr = self.current_tid(core);
        let tag = lock.tag.load(Ordering::Acquire);
        if tag >> 1 != curr {
            panic!("light lock: thread {} unlocking a lock owned by {}", curr, tag >> 1);
        }

        match self.transfer_lock_ownership(curr, lock.key()) {
            Some((next, more)) => {
                let new_tag = (next << 1) | if more { TAG_WAITERS } else { 0 };
                lock.tag.store(new_tag, Ordering::Release);
                log_trace!("light lock handoff {} -> {}", curr, next);
                self.make_runnable(core, next, KX_OK);
            }
            None => {
                // Every waiter bailed (timeout or cancellation) after the
                // flag was set.
                lock.tag.store(0, Ordering::Release);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_path_tagging() {
        let lock = LightLock::new();
        assert!(!lock.is_locked());
        assert!(lock.try_lock(5));
        assert!(lock.is_locked());
        assert_eq!(lock.owner(), Some(5));
        assert!(!lock.has_waiters());
        assert!(!lock.try_lock(6));
    }
}
