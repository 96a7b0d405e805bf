// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread Management
//!
//! This module provides the thread control block and the thread table for
//! the Kestrel kernel. Threads are the schedulable units of execution;
//! every mutation of a thread's scheduling state happens under the global
//! scheduler lock.
//!
//! # Design
//!
//! - Each thread has a unique thread ID (TID), never reused
//! - Threads have states (Initialized, Runnable, Waiting, Terminated) with
//!   suspension as a nesting-counted overlay
//! - Priorities are 0 (highest) through 63 (lowest); the current priority
//!   may sit above the base priority while the thread inherits from a
//!   waiter on a lock it owns
//! - Run-queue and wait-list membership use links embedded in the control
//!   block, resolved through the thread table, so queue operations never
//!   allocate
//!
//! # Thread States
//!
//! ```text
//! Initialized -> Runnable <-> Waiting
//!         \          |          |
//!          \         v          v
//!           +--> Terminated <---+
//! ```

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::object::resource_limit::ResourceKind;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Invalid thread ID
pub const TID_INVALID: Tid = 0;

/// ============================================================================
/// Thread State
/// ============================================================================

/// Thread state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread has been created but not yet started
    Initialized = 0,

    /// Thread is runnable (queued, or current on some core)
    Runnable = 1,

    /// Thread is parked on a synchronization object, lock, tree or timer
    Waiting = 2,

    /// Thread has exited; it is linked into nothing
    Terminated = 3,
}

impl ThreadState {
    /// Check if the thread is still live
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

bitflags! {
    /// Per-thread flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// A termination request is pending; wait entry points refuse to park
        const TERMINATION_REQUESTED = 1 << 0;
    }
}

/// ============================================================================
/// Wait Records
/// ============================================================================

/// Membership record for the condition-variable tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CvWait {
    /// Caller-supplied 64-bit key this waiter is multiplexed under
    pub key: u64,
    /// User mutex word re-acquired on wake
    pub addr: VAddr,
    /// Value stored into the mutex word when ownership lands on this waiter
    pub tag: u32,
    /// Priority the tree entry was inserted at
    pub prio: Priority,
}

/// Membership record for the address-arbiter tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArbWait {
    /// User address this waiter is keyed under
    pub addr: VAddr,
    /// Priority the tree entry was inserted at
    pub prio: Priority,
}

/// ============================================================================
/// Thread Control Block
/// ============================================================================

/// Thread control block
///
/// One per thread, owned by the thread table. The embedded link fields are
/// the storage for every list the thread can be a member of; the lists
/// themselves only chase TIDs through the table.
pub struct Thread {
    /// Thread ID
    pub id: Tid,

    /// Owning process (weak back-reference; process internals are out of
    /// scope for the scheduling core)
    pub process: Pid,

    /// Lifecycle state
    pub state: ThreadState,

    /// Flag bits
    pub flags: ThreadFlags,

    /// Suspension nesting depth; nonzero means held out of the run queues
    pub suspend_count: u32,

    /// Priority assigned at creation or by set_priority
    pub base_priority: Priority,

    /// Effective priority, possibly boosted by priority inheritance
    pub priority: Priority,

    /// Bitmask of cores this thread may run on
    pub affinity_mask: CpuMask,

    /// Preferred core
    pub ideal_core: CpuId,

    /// Core the thread last ran on or is queued on
    pub current_core: CpuId,

    /// References held by the owning process, the scheduler, and wait lists
    pub ref_count: u32,

    // Run-queue link (intrusive, valid while queued_level is Some)
    pub(crate) run_prev: Option<Tid>,
    pub(crate) run_next: Option<Tid>,
    pub(crate) queued_level: Option<Priority>,
    pub(crate) queued_core: Option<CpuId>,

    /// Result delivered by the wake path, read when the thread resumes
    pub wait_result: Status,

    /// Arrival stamp for the current wait; breaks priority ties FIFO
    pub(crate) wait_seq: u64,

    /// Objects this thread is blocked on via wait_synchronization
    pub(crate) wait_objects: Vec<ObjId>,

    /// Index of the object that satisfied the wait
    pub synced_index: Option<usize>,

    /// Condition-variable tree membership
    pub(crate) cv_wait: Option<CvWait>,

    /// Address-arbiter tree membership
    pub(crate) arb_wait: Option<ArbWait>,

    /// Timeout timer membership: (deadline, timer sequence)
    pub(crate) timer_key: Option<(Tick, u64)>,

    /// Threads blocked on locks this thread owns, kept in (priority,
    /// arrival) order; the source set for priority inheritance
    pub(crate) lock_waiters: Vec<Tid>,

    /// Address of the lock this thread is itself blocked on, if any
    pub(crate) waiting_lock_key: Option<VAddr>,

    /// Owner of that lock
    pub(crate) lock_owner: Option<Tid>,

    /// Tag written into a user mutex word when ownership is handed to this
    /// thread
    pub(crate) lock_wait_tag: u32,

    /// Reservation this thread is parked on at the resource-limit gate
    pub(crate) pending_reserve: Option<(ResourceKind, i64)>,
}

impl Thread {
    pub(crate) fn new(id: Tid, process: Pid, priority: Priority, affinity_mask: CpuMask, ideal_core: CpuId) -> Self {
        Self {
            id,
            process,
            state: ThreadState::Initialized,
            flags: ThreadFlags::empty(),
            suspend_count: 0,
            base_priority: priority,
            priority,
            affinity_mask,
            ideal_core,
            current_core: ideal_core,
            ref_count: 1,
            run_prev: None,
            run_next: None,
            queued_level: None,
            queued_core: None,
            wait_result: KX_OK,
            wait_seq: 0,
            wait_objects: Vec::new(),
            synced_index: None,
            cv_wait: None,
            arb_wait: None,
            timer_key: None,
            lock_waiters: Vec::new(),
            waiting_lock_key: None,
            lock_owner: None,
            lock_wait_tag: 0,
            pending_reserve: None,
        }
    }

    /// The single authoritative "may this thread be picked" predicate.
    pub fn is_schedulable(&self) -> bool {
        self.state == ThreadState::Runnable && self.suspend_count == 0
    }

    /// Check if a termination request is pending.
    pub fn is_termination_requested(&self) -> bool {
        self.flags.contains(ThreadFlags::TERMINATION_REQUESTED)
    }

    /// Check if the thread may run on `core`.
    pub fn allows_core(&self, core: CpuId) -> bool {
        self.affinity_mask & (1 << core as u64) != 0
    }

    /// Check if the thread is linked into any wait structure.
    pub(crate) fn is_linked(&self) -> bool {
        self.queued_level.is_some()
            || !self.wait_objects.is_empty()
            || self.cv_wait.is_some()
            || self.arb_wait.is_some()
            || self.timer_key.is_some()
            || self.lock_owner.is_some()
            || self.pending_reserve.is_some()
    }
}

/// ============================================================================
/// Thread Table
/// ============================================================================

/// Thread table, the arena that owns every thread control block.
///
/// Lists and trees reference threads by TID and borrow their link storage
/// through this table; a thread is removed only once its reference count
/// reaches zero and it is linked into nothing.
pub struct ThreadTable {
    entries: BTreeMap<Tid, Thread>,
    next_tid: Tid,
}

impl ThreadTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_tid: 1,
        }
    }

    pub(crate) fn create(&mut self, process: Pid, priority: Priority, affinity_mask: CpuMask, ideal_core: CpuId) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.entries.insert(tid, Thread::new(tid, process, priority, affinity_mask, ideal_core));
        tid
    }

    /// Look up a thread that may have been removed.
    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.entries.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.entries.get_mut(&tid)
    }

    /// Look up a thread that a live link refers to. A dangling link here is
    /// scheduler-state corruption and halts the core.
    pub fn t(&self, tid: Tid) -> &Thread {
        match self.entries.get(&tid) {
            Some(t) => t,
            None => panic!("thread table: dangling link to tid {}", tid),
        }
    }

    pub fn t_mut(&mut self, tid: Tid) -> &mut Thread {
        match self.entries.get_mut(&tid) {
            Some(t) => t,
            None => panic!("thread table: dangling link to tid {}", tid),
        }
    }

    /// Drop the table entry for a dead, fully unlinked thread.
    pub(crate) fn remove(&mut self, tid: Tid) {
        if let Some(t) = self.entries.get(&tid) {
            if t.is_linked() {
                panic!("thread table: removing linked thread {}", tid);
            }
            self.entries.remove(&tid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
