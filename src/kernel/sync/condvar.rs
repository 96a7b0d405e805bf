// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process-Wide Condition Variable
//!
//! One wait tree multiplexes every logical condition in a process: nodes
//! are ordered by a caller-supplied 64-bit key, then by thread priority,
//! then by arrival, so a signal wakes the most urgent matching waiter and
//! equal priorities wake FIFO.
//!
//! The condition variable is built on the user mutex word that
//! `arbitrate_lock`/`arbitrate_unlock` manage: wait atomically releases
//! the word (handing it to its best lock waiter), parks in the tree, and
//! on signal is either handed the word outright or requeued as a lock
//! waiter on the word's current owner, so the woken thread owns the
//! mutex when it finally runs. Both decisions happen under the scheduler
//! lock with no window for a lost wakeup.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::object::handle::HANDLE_WAIT_MASK;
use crate::kernel::sched::{KernelState, Outcome};
use crate::kernel::thread::{CvWait, ThreadState};
use crate::kernel::timer::{timeout_from_ns, Timeout};
use crate::kernel::usercopy::UserMemory;
use alloc::collections::BTreeSet;

use crate::log_trace;

/// ============================================================================
/// Wait Tree
/// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CvNode {
    key: u64,
    prio: Priority,
    seq: u64,
    tid: Tid,
}

/// Keyed condition-variable wait tree.
pub struct CondvarTree {
    set: BTreeSet<CvNode>,
}

impl CondvarTree {
    pub(crate) fn new() -> Self {
        Self { set: BTreeSet::new() }
    }

    pub(crate) fn insert(&mut self, key: u64, prio: Priority, seq: u64, tid: Tid) {
        self.set.insert(CvNode { key, prio, seq, tid });
    }

    pub(crate) fn remove(&mut self, key: u64, prio: Priority, seq: u64, tid: Tid) -> bool {
        self.set.remove(&CvNode { key, prio, seq, tid })
    }

    /// Best matching waiter: lowest priority value, earliest arrival.
    fn first_for(&self, key: u64) -> Option<CvNode> {
        let node = self
            .set
            .range(CvNode { key, prio: 0, seq: 0, tid: 0 }..)
            .next()?;
        if node.key == key {
            Some(*node)
        } else {
            None
        }
    }

    /// Matching waiters in wake order; `max` of zero or less means all.
    #[cfg(test)]
    fn collect(&self, key: u64, max: i32) -> alloc::vec::Vec<CvNode> {
        let mut out = alloc::vec::Vec::new();
        for node in self.set.range(
            CvNode { key, prio: 0, seq: 0, tid: 0 }..,
        ) {
            if node.key != key {
                break;
            }
            if max > 0 && out.len() >= max as usize {
                break;
            }
            out.push(*node);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// ============================================================================
/// User Mutex Arbitration
/// ============================================================================

impl KernelState {
    /// Park the current thread behind the user mutex word at `addr`.
    ///
    /// Only meaningful when the word reads `owner_handle | wait flag`;
    /// any other value means the race already resolved and user mode
    /// retries its own acquire loop.
    pub fn arbitrate_lock(&mut self, core: CpuId, owner_handle: Handle, addr: VAddr, tag: u32) -> Outcome {
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }

        let val = match self.user.read32(addr) {
            Ok(v) => v,
            Err(e) => return Outcome::Done(e),
        };
        if val != (owner_handle | HANDLE_WAIT_MASK) {
            return Outcome::Done(KX_OK);
        }

        let owner = match self.handles.get_thread(owner_handle) {
            Some(tid) => tid,
            None => return Outcome::Done(KX_ERR_BAD_HANDLE),
        };
        if owner == curr {
            return Outcome::Done(KX_ERR_INVALID_STATE);
        }
        match self.threads.get(owner) {
            Some(o) if o.state != ThreadState::Terminated => {}
            _ => return Outcome::Done(KX_ERR_INVALID_STATE),
        }

        log_trace!("thread {} blocks on user mutex {:#x} owner {}", curr, addr, owner);
        self.add_lock_waiter(owner, curr, addr, tag);
        self.block_current(core, Timeout::Infinite);
        Outcome::Parked
    }

    /// Release the user mutex word at `addr`: the best waiter gets the
    /// word (wait flag set while more remain) and wakes owning it, or the
    /// word is cleared.
    pub fn arbitrate_unlock(&mut self, core: CpuId, addr: VAddr) -> Status {
        let curr = self.current_tid(core);

        let next_info = self.peek_lock_waiter(curr, addr);
        let new_val = match next_info {
            Some((next, more)) => {
                self.threads.t(next).lock_wait_tag | if more { HANDLE_WAIT_MASK } else { 0 }
            }
            None => 0,
        };
        if let Err(e) = self.user.write32(addr, new_val) {
            return e;
        }
        if next_info.is_some() {
            if let Some((next, _)) = self.transfer_lock_ownership(curr, addr) {
                log_trace!("user mutex {:#x} handoff {} -> {}", addr, curr, next);
                self.make_runnable(core, next, KX_OK);
            }
        }
        KX_OK
    }

    /// ========================================================================
    /// Condition Variable
    /// ========================================================================

    /// Atomically release the user mutex at `addr` and park under
    /// `key`. On wake the signal path has already arbitrated the mutex
    /// back to this thread.
    pub fn condvar_wait(&mut self, core: CpuId, addr: VAddr, key: u64, tag: u32, timeout_ns: Nanoseconds) -> Outcome {
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }

        // Hand the mutex to its best waiter (or clear it), in the same
        // critical section that inserts us into the tree.
        let next_info = self.peek_lock_waiter(curr, addr);
        let new_val = match next_info {
            Some((next, more)) => {
                self.threads.t(next).lock_wait_tag | if more { HANDLE_WAIT_MASK } else { 0 }
            }
            None => 0,
        };
        if let Err(e) = self.user.write32(addr, new_val) {
            return Outcome::Done(e);
        }
        if next_info.is_some() {
            if let Some((next, _)) = self.transfer_lock_ownership(curr, addr) {
                self.make_runnable(core, next, KX_OK);
            }
        }

        let timeout = timeout_from_ns(self.timer.now(), timeout_ns);
        if timeout == Timeout::Expired {
            return Outcome::Done(KX_ERR_TIMED_OUT);
        }

        let seq = self.next_wait_seq();
        let prio = {
            let t = self.threads.t_mut(curr);
            t.wait_seq = seq;
            t.cv_wait = Some(CvWait { key, addr, tag, prio: t.priority });
            t.priority
        };
        self.condvar.insert(key, prio, seq, curr);
        log_trace!("thread {} waits on cv key {:#x}", curr, key);
        self.block_current(core, timeout);
        Outcome::Parked
    }

    /// Wake up to `count` waiters under `key` in (priority, arrival)
    /// order; `count` of zero or less wakes all. Never fails: waiters
    /// whose mutex word faults observe the fault as their wait result.
    pub fn condvar_signal(&mut self, acting: CpuId, key: u64, count: i32) -> usize {
        let mut woken = 0;
        // Re-query the head each round: arbitrating one waiter can boost
        // priorities and reorder the remaining tree entries.
        while count <= 0 || woken < count as usize {
            let node = match self.condvar.first_for(key) {
                Some(node) => node,
                None => break,
            };
            self.condvar.remove(node.key, node.prio, node.seq, node.tid);
            let rec = match self.threads.get_mut(node.tid).and_then(|t| t.cv_wait.take()) {
                Some(rec) => rec,
                None => continue,
            };
            self.condvar_signal_one(acting, node.tid, rec.addr, rec.tag);
            woken += 1;
        }
        woken
    }

    /// Arbitrate the mutex for one signaled waiter: grant the word if
    /// free, otherwise requeue the waiter behind the word's owner.
    fn condvar_signal_one(&mut self, acting: CpuId, tid: Tid, addr: VAddr, tag: u32) {
        let val = match self.user.read32(addr) {
            Ok(v) => v,
            Err(e) => {
                self.make_runnable(acting, tid, e);
                return;
            }
        };

        if val == 0 {
            match self.user.write32(addr, tag) {
                Ok(()) => self.make_runnable(acting, tid, KX_OK),
                Err(e) => self.make_runnable(acting, tid, e),
            }
            return;
        }

        // Contended: the woken thread becomes a lock waiter of the
        // current owner and keeps sleeping until the handoff.
        let owner_handle = val & !HANDLE_WAIT_MASK;
        let owner = match self.handles.get_thread(owner_handle) {
            Some(o) => o,
            None => {
                self.make_runnable(acting, tid, KX_ERR_INVALID_STATE);
                return;
            }
        };
        match self.threads.get(owner) {
            Some(o) if o.state != ThreadState::Terminated && owner != tid => {}
            _ => {
                self.make_runnable(acting, tid, KX_ERR_INVALID_STATE);
                return;
            }
        }
        if val & HANDLE_WAIT_MASK == 0 {
            if let Err(e) = self.user.write32(addr, val | HANDLE_WAIT_MASK) {
                self.make_runnable(acting, tid, e);
                return;
            }
        }
        log_trace!("cv waiter {} requeued on user mutex {:#x} owner {}", tid, addr, owner);
        self.add_lock_waiter(owner, tid, addr, tag);
    }
}

// ============================================================================
// Tests
// ============================================================================
