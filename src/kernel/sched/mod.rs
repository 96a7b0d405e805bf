// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread Scheduler
//!
//! This module implements the per-core scheduler for the Kestrel kernel
//! and owns the kernel state aggregate that every other scheduling-core
//! module operates on.
//!
//! # Design
//!
//! - **Fixed priority**: 64 levels, 0 most urgent; a core always runs the
//!   highest-priority runnable thread its affinity rules allow
//! - **Round-robin within a level**: voluntary yield rotates to the tail
//!   of the caller's level; nothing else time-slices
//! - **One lock**: all state lives behind the global scheduler lock; every
//!   entry point takes it exactly once
//! - **Deferred cross-core effects**: a change made on core A marks core
//!   B's needs-reschedule flag and optionally latches an IPI; core B acts
//!   at its own next safe point
//!
//! # Usage
//!
//! ```text
//! let k = Kernel::new();
//! let tid = k.create_thread(1, 16, CPU_MASK_ALL, 0)?;
//! k.start_thread(0, tid)?;
//! assert_eq!(k.current_thread(0), Some(tid));
//! ```

pub mod run_queue;

use core::cell::UnsafeCell;

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::object::handle::HandleTable;
use crate::kernel::object::resource_limit::{ResourceKind, ResourceLimit};
use crate::kernel::percpu::PerCore;
use crate::kernel::spinlock::SchedulerLock;
use crate::kernel::sync::address_arbiter::ArbiterTree;
use crate::kernel::sync::condvar::CondvarTree;
use crate::kernel::sync::wait_object::ObjectTable;
use crate::kernel::thread::{ThreadFlags, ThreadState, ThreadTable};
use crate::kernel::timer::{Timeout, TimerQueue};
use crate::kernel::usercopy::FlatUserSpace;

use crate::{log_debug, log_trace};

/// Outcome of a potentially-blocking kernel entry point.
///
/// In the running system the return value of a parked call is produced
/// when the thread is next scheduled and written into its saved register
/// state; here that deferred value is read from the thread's
/// `wait_result` once it is runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call finished without blocking; the status is final.
    Done(Status),
    /// The calling thread parked. Its wake path delivers the final status.
    Parked,
}

impl Outcome {
    /// Final status for calls known not to have parked.
    pub fn status(self) -> Status {
        match self {
            Outcome::Done(s) => s,
            Outcome::Parked => panic!("outcome: call parked"),
        }
    }
}

/// ============================================================================
/// Kernel Aggregate
/// ============================================================================

/// Everything the scheduler lock protects.
pub struct KernelState {
    /// Thread table (the arena behind every intrusive list)
    pub threads: ThreadTable,

    /// Per-core blocks
    pub cores: [PerCore; MAX_CORES],

    /// Timeout timer queue and the monotonic clock driving it
    pub timer: TimerQueue,

    /// Signalable kernel objects
    pub objects: ObjectTable,

    /// Handle table (collaborator; narrow lookup only)
    pub handles: HandleTable,

    /// Process-wide condition-variable wait tree
    pub condvar: CondvarTree,

    /// Address-arbiter wait tree
    pub arbiter: ArbiterTree,

    /// Resource-limit gate consulted by thread creation
    pub resource_limit: ResourceLimit,

    /// Page-table-checked user memory access
    pub user: FlatUserSpace,

    /// Arrival-order stamp for FIFO tie-breaks in every wait structure
    wait_seq: u64,
}

/// The kernel: the scheduler lock plus the state it guards.
pub struct Kernel {
    lock: SchedulerLock,
    state: UnsafeCell<KernelState>,
}

// SAFETY: all access to `state` goes through the scheduler lock.
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

impl Kernel {
    pub fn new() -> Self {
        Self {
            lock: SchedulerLock::new(),
            state: UnsafeCell::new(KernelState::new()),
        }
    }

    /// Run `f` with the scheduler lock held.
    ///
    /// Nested use from inside `f` is scheduler-state corruption and halts
    /// the core rather than aliasing the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let guard = self.lock.lock();
        if !guard.is_outermost() {
            panic!("scheduler lock: nested state access");
        }
        // SAFETY: the scheduler lock is held and this is the outermost
        // acquisition on this core; interrupts are masked.
        let state = unsafe { &mut *self.state.get() };
        f(state)
    }

    pub fn create_thread(&self, process: Pid, priority: Priority, affinity_mask: CpuMask, ideal_core: CpuId) -> Result<Tid> {
        self.with(|s| s.create_thread(process, priority, affinity_mask, ideal_core))
    }

    pub fn start_thread(&self, acting: CpuId, tid: Tid) -> Result {
        self.with(|s| {
            s.start_thread(acting, tid)?;
            s.preempt(acting);
            Ok(())
        })
    }

    pub fn current_thread(&self, core: CpuId) -> Option<Tid> {
        self.with(|s| s.cores[core as usize].current)
    }

    pub fn wait_result(&self, tid: Tid) -> Status {
        self.with(|s| s.threads.t(tid).wait_result)
    }

    pub fn advance_ticks(&self, acting: CpuId, dt: Tick) {
        self.with(|s| {
            s.advance_ticks(acting, dt);
            s.preempt(acting);
        })
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// ============================================================================
/// Core Scheduling Operations
/// ============================================================================

impl KernelState {
    pub fn new() -> Self {
        Self {
            threads: ThreadTable::new(),
            cores: [PerCore::new(0), PerCore::new(1), PerCore::new(2), PerCore::new(3)],
            timer: TimerQueue::new(),
            objects: ObjectTable::new(),
            handles: HandleTable::new(),
            condvar: CondvarTree::new(),
            arbiter: ArbiterTree::new(),
            resource_limit: ResourceLimit::new(),
            user: FlatUserSpace::new(),
            wait_seq: 0,
        }
    }

    pub(crate) fn next_wait_seq(&mut self) -> u64 {
        self.wait_seq += 1;
        self.wait_seq
    }

    /// Thread currently executing on `core`, if any.
    pub fn current_thread(&self, core: CpuId) -> Option<Tid> {
        self.cores[core as usize].current
    }

    /// Thread currently executing on `core`; calling a thread-context
    /// entry point from an idle core is fatal.
    pub(crate) fn current_tid(&self, core: CpuId) -> Tid {
        match self.cores[core as usize].current {
            Some(tid) => tid,
            None => panic!("core {}: thread-context call while idle", core),
        }
    }

    /// Create a thread in the Initialized state.
    pub fn create_thread(&mut self, process: Pid, priority: Priority, affinity_mask: CpuMask, ideal_core: CpuId) -> Result<Tid> {
        if priority > LOWEST_PRIORITY {
            return Err(KX_ERR_INVALID_ARGS);
        }
        if affinity_mask == 0 || affinity_mask & !CPU_MASK_ALL != 0 {
            return Err(KX_ERR_INVALID_ARGS);
        }
        if affinity_mask & (1 << ideal_core as u64) == 0 {
            return Err(KX_ERR_INVALID_ARGS);
        }
        if !self.resource_limit.try_charge(ResourceKind::Threads, 1) {
            return Err(KX_ERR_OUT_OF_RESOURCE);
        }

        let tid = self.threads.create(process, priority, affinity_mask, ideal_core);
        log_debug!("created thread {} prio={} mask={:#x} ideal={}", tid, priority, affinity_mask, ideal_core);
        Ok(tid)
    }

    /// Start a thread: Initialized -> Runnable, enqueued on its ideal core.
    pub fn start_thread(&mut self, acting: CpuId, tid: Tid) -> Result {
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        if t.state != ThreadState::Initialized {
            return Err(KX_ERR_BAD_STATE);
        }
        t.state = ThreadState::Runnable;
        t.current_core = t.ideal_core;
        t.ref_count += 1; // scheduler reference, dropped at termination
        if t.suspend_count == 0 {
            self.enqueue_thread(acting, tid);
        }
        Ok(())
    }

    /// Home core for a wake or migration: last core if still allowed,
    /// else the ideal core, else the first allowed core.
    fn pick_home_core(&self, tid: Tid) -> CpuId {
        let t = self.threads.t(tid);
        if t.allows_core(t.current_core) {
            t.current_core
        } else if t.allows_core(t.ideal_core) {
            t.ideal_core
        } else {
            t.affinity_mask.trailing_zeros() as CpuId
        }
    }

    /// Put a schedulable thread on a run queue and ask for preemption if
    /// it beats the target core's current thread.
    pub(crate) fn enqueue_thread(&mut self, acting: CpuId, tid: Tid) {
        let core = self.pick_home_core(tid);
        let prio = {
            let st = &mut *self;
            st.cores[core as usize].run_queue.push_back(&mut st.threads, tid);
            st.threads.t(tid).priority
        };
        log_trace!("enqueue thread {} prio={} core={}", tid, prio, core);

        let cur_prio = match self.cores[core as usize].current {
            Some(cur) => self.threads.t(cur).priority,
            None => IDLE_PRIORITY,
        };
        if prio < cur_prio {
            self.request_reschedule(acting, core);
        }
    }

    /// Pick and install the next thread for `core`. The caller has
    /// already parked, re-queued or discarded the previous current thread.
    pub(crate) fn select_next(&mut self, core: CpuId) {
        let st = &mut *self;
        let next = st.cores[core as usize].run_queue.pop_front(&mut st.threads);
        let pc = &mut st.cores[core as usize];
        pc.current = next;
        pc.needs_reschedule = false;
        pc.ipi_pending = false;
        match next {
            Some(tid) => log_trace!("core {} runs thread {}", core, tid),
            None => {
                pc.idle_count += 1;
                log_trace!("core {} idle", core);
            }
        }
    }

    /// Safe point: act on a pending reschedule for `core`.
    ///
    /// A preempted current thread goes back at the head of its level so it
    /// resumes before its round-robin peers.
    pub fn preempt(&mut self, core: CpuId) {
        let pc = &self.cores[core as usize];
        if !pc.preemptible() || !pc.needs_reschedule {
            return;
        }
        if let Some(cur) = pc.current {
            let st = &mut *self;
            if st.threads.t(cur).is_schedulable() {
                st.cores[core as usize].run_queue.push_front(&mut st.threads, cur);
            }
            st.cores[core as usize].current = None;
        }
        self.select_next(core);
    }

    /// Voluntary yield: rotate the caller to the tail of its own level.
    pub fn yield_thread(&mut self, core: CpuId) -> Result {
        let cur = self.cores[core as usize].current.ok_or(KX_ERR_BAD_STATE)?;
        {
            let st = &mut *self;
            st.cores[core as usize].run_queue.push_back(&mut st.threads, cur);
            st.cores[core as usize].current = None;
        }
        self.select_next(core);
        Ok(())
    }

    /// Enter a non-preemptible section on `core`.
    pub fn preempt_disable(&mut self, core: CpuId) {
        self.cores[core as usize].preempt_disable += 1;
    }

    /// Leave a non-preemptible section; a latched reschedule is honored
    /// here, at the section's end.
    pub fn preempt_enable(&mut self, core: CpuId) {
        let pc = &mut self.cores[core as usize];
        if pc.preempt_disable == 0 {
            panic!("core {}: unbalanced preempt_enable", core);
        }
        pc.preempt_disable -= 1;
        if pc.preempt_disable == 0 {
            self.preempt(core);
        }
    }

    /// ========================================================================
    /// Blocking and Waking
    /// ========================================================================

    /// Park the current thread of `core`. The caller has already linked it
    /// into the structure it waits on; `timeout` arms the timeout timer.
    pub(crate) fn block_current(&mut self, core: CpuId, timeout: Timeout) {
        let cur = self.current_tid(core);
        {
            let t = self.threads.t_mut(cur);
            t.state = ThreadState::Waiting;
            t.synced_index = None;
        }
        if let Timeout::Deadline(deadline) = timeout {
            let key = self.timer.arm(cur, deadline);
            self.threads.t_mut(cur).timer_key = Some(key);
        }
        self.cores[core as usize].current = None;
        self.select_next(core);
    }

    /// Deliver a wake: record the result, mark Runnable, requeue. The
    /// caller has already unlinked the thread from the structure that woke
    /// it; any other memberships (timeout timer included) are torn down
    /// here, which is what makes a racing wake and timeout commute.
    pub(crate) fn make_runnable(&mut self, acting: CpuId, tid: Tid, result: Status) {
        let t = match self.threads.get_mut(tid) {
            Some(t) => t,
            None => return,
        };
        if t.state != ThreadState::Waiting {
            // The other waker won; nothing to do.
            return;
        }
        // A reservation that times out reports the capacity miss, not the
        // clock.
        let result = if t.pending_reserve.is_some() && result == KX_ERR_TIMED_OUT {
            KX_ERR_OUT_OF_RESOURCE
        } else {
            result
        };
        if let Some(key) = t.timer_key.take() {
            self.timer.cancel(tid, key);
        }
        self.unlink_wait(tid);
        let t = self.threads.t_mut(tid);
        t.wait_result = result;
        t.state = ThreadState::Runnable;
        let suspended = t.suspend_count > 0;
        log_trace!("wake thread {} result={}", tid, result);
        if !suspended {
            self.enqueue_thread(acting, tid);
        }
    }

    /// Cancel an in-progress wait, delivering `result`. Returns false if
    /// the thread was not waiting.
    pub(crate) fn cancel_wait(&mut self, acting: CpuId, tid: Tid, result: Status) -> bool {
        match self.threads.get(tid) {
            Some(t) if t.state == ThreadState::Waiting => {}
            _ => return false,
        }
        self.make_runnable(acting, tid, result);
        true
    }

    /// Unlink a thread from every wait structure it is a member of.
    pub(crate) fn unlink_wait(&mut self, tid: Tid) {
        // Synchronization objects
        let objs = core::mem::take(&mut self.threads.t_mut(tid).wait_objects);
        for oid in objs {
            if let Some(obj) = self.objects.get_mut(oid) {
                obj.waiters.retain(|&w| w != tid);
            }
        }

        // Condition-variable tree
        if let Some(cv) = self.threads.t_mut(tid).cv_wait.take() {
            let seq = self.threads.t(tid).wait_seq;
            self.condvar.remove(cv.key, cv.prio, seq, tid);
        }

        // Address-arbiter tree
        if let Some(arb) = self.threads.t_mut(tid).arb_wait.take() {
            let seq = self.threads.t(tid).wait_seq;
            self.arbiter.remove(arb.addr, arb.prio, seq, tid);
        }

        // Lock wait
        if let Some(owner) = self.threads.t_mut(tid).lock_owner.take() {
            self.threads.t_mut(tid).waiting_lock_key = None;
            if let Some(o) = self.threads.get_mut(owner) {
                o.lock_waiters.retain(|&w| w != tid);
            }
            self.refresh_inherited_priority(owner);
        }

        // Resource-limit gate
        if self.threads.t_mut(tid).pending_reserve.take().is_some() {
            self.resource_limit.waiters.retain(|&w| w != tid);
        }

        // Pending timeout
        if let Some(key) = self.threads.t_mut(tid).timer_key.take() {
            self.timer.cancel(tid, key);
        }
    }

    /// ========================================================================
    /// Priority
    /// ========================================================================

    /// Change a thread's base priority. The effective priority stays at
    /// least as urgent as the best waiter on any lock the thread holds.
    pub fn set_priority(&mut self, acting: CpuId, tid: Tid, priority: Priority) -> Result {
        if priority > LOWEST_PRIORITY {
            return Err(KX_ERR_INVALID_ARGS);
        }
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        t.base_priority = priority;
        let eff = self.effective_priority(tid);
        self.apply_priority(acting, tid, eff, true);
        Ok(())
    }

    fn effective_priority(&self, tid: Tid) -> Priority {
        let t = self.threads.t(tid);
        let mut eff = t.base_priority;
        for &w in &t.lock_waiters {
            eff = eff.min(self.threads.t(w).priority);
        }
        eff
    }

    /// Recompute one thread's inherited priority from its direct lock
    /// waiters. Inheritance is one level only: the result is not pushed
    /// onward to a lock this thread itself waits on.
    pub(crate) fn refresh_inherited_priority(&mut self, tid: Tid) {
        if self.threads.get(tid).is_none() {
            return;
        }
        let eff = self.effective_priority(tid);
        if eff != self.threads.t(tid).priority {
            // Acting core is only relevant for the IPI path of requeue
            // checks; a priority refresh uses the boosted thread's core.
            let core = self.threads.t(tid).current_core;
            self.apply_priority(core, tid, eff, false);
        }
    }

    /// The single atomic "update priority" operation: unlink, retag,
    /// relink, so a thread is never observable at a stale level.
    fn apply_priority(&mut self, acting: CpuId, tid: Tid, new: Priority, refresh_owner: bool) {
        let old = self.threads.t(tid).priority;
        if old == new {
            return;
        }

        // Run queue: remove, retag, reinsert at the new level.
        let queued_core = self.threads.t(tid).queued_core;
        if let Some(core) = queued_core {
            let st = &mut *self;
            st.cores[core as usize].run_queue.remove(&mut st.threads, tid);
            st.threads.t_mut(tid).priority = new;
            st.cores[core as usize].run_queue.push_back(&mut st.threads, tid);

            let cur_prio = match st.cores[core as usize].current {
                Some(cur) => st.threads.t(cur).priority,
                None => IDLE_PRIORITY,
            };
            if new < cur_prio {
                self.request_reschedule(acting, core);
            }
        } else {
            self.threads.t_mut(tid).priority = new;
        }

        // Ordered trees keep (priority, arrival) positions current.
        let seq = self.threads.t(tid).wait_seq;
        if let Some(mut cv) = self.threads.t(tid).cv_wait {
            self.condvar.remove(cv.key, cv.prio, seq, tid);
            cv.prio = new;
            self.condvar.insert(cv.key, new, seq, tid);
            self.threads.t_mut(tid).cv_wait = Some(cv);
        }
        if let Some(mut arb) = self.threads.t(tid).arb_wait {
            self.arbiter.remove(arb.addr, arb.prio, seq, tid);
            arb.prio = new;
            self.arbiter.insert(arb.addr, new, seq, tid);
            self.threads.t_mut(tid).arb_wait = Some(arb);
        }

        // Object wait lists stay priority-sorted.
        let objs = self.threads.t(tid).wait_objects.clone();
        for oid in objs {
            let st = &mut *self;
            if let Some(obj) = st.objects.get_mut(oid) {
                obj.waiters.retain(|&w| w != tid);
                crate::kernel::sync::wait_object::insert_waiter_sorted(&st.threads, &mut obj.waiters, tid);
            }
        }

        // Reposition among the waiters of the lock this thread blocks on,
        // and let that owner re-derive its boost from its direct waiters.
        if let Some(owner) = self.threads.t(tid).lock_owner {
            self.reposition_lock_waiter(owner, tid);
            if refresh_owner {
                self.refresh_inherited_priority(owner);
            }
        }

        // A deboosted current thread may no longer be the right pick.
        for core in 0..MAX_CORES {
            if self.cores[core].current == Some(tid) && new > old {
                let front = self.cores[core].run_queue.highest_level();
                if let Some(level) = front {
                    if level < new {
                        self.request_reschedule(acting, core as CpuId);
                    }
                }
            }
        }
    }

    /// ========================================================================
    /// Affinity
    /// ========================================================================

    /// Change a thread's affinity mask and ideal core. This is one of the
    /// two events allowed to migrate a running thread off its core.
    pub fn set_affinity(&mut self, acting: CpuId, tid: Tid, affinity_mask: CpuMask, ideal_core: CpuId) -> Result {
        if affinity_mask == 0 || affinity_mask & !CPU_MASK_ALL != 0 {
            return Err(KX_ERR_INVALID_ARGS);
        }
        if affinity_mask & (1 << ideal_core as u64) == 0 {
            return Err(KX_ERR_INVALID_ARGS);
        }
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        t.affinity_mask = affinity_mask;
        t.ideal_core = ideal_core;

        // Queued on a core the new mask forbids: migrate now.
        if let Some(core) = self.threads.t(tid).queued_core {
            if affinity_mask & (1 << core as u64) == 0 {
                {
                    let st = &mut *self;
                    st.cores[core as usize].run_queue.remove(&mut st.threads, tid);
                }
                self.enqueue_thread(acting, tid);
            }
        }

        // Running on a core the new mask forbids: evict at its safe point
        // and requeue on an allowed core.
        for core in 0..MAX_CORES {
            if self.cores[core].current == Some(tid) && affinity_mask & (1 << core as u64) == 0 {
                self.cores[core].current = None;
                self.enqueue_thread(acting, tid);
                self.request_reschedule(acting, core as CpuId);
                if core as CpuId == acting {
                    self.select_next(acting);
                }
            }
        }
        Ok(())
    }

    /// ========================================================================
    /// Suspension
    /// ========================================================================

    /// Administratively pause a thread. Nests; each suspend needs a
    /// matching resume.
    pub fn suspend_thread(&mut self, acting: CpuId, tid: Tid) -> Result {
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        if t.state == ThreadState::Terminated {
            return Err(KX_ERR_BAD_STATE);
        }
        t.suspend_count += 1;
        if t.suspend_count > 1 {
            return Ok(());
        }

        if let Some(core) = self.threads.t(tid).queued_core {
            let st = &mut *self;
            st.cores[core as usize].run_queue.remove(&mut st.threads, tid);
        }
        for core in 0..MAX_CORES {
            if self.cores[core].current == Some(tid) {
                self.cores[core].current = None;
                self.request_reschedule(acting, core as CpuId);
                if core as CpuId == acting {
                    self.select_next(acting);
                }
            }
        }
        // A Waiting thread stays parked; the overlay only matters once it
        // would become runnable.
        Ok(())
    }

    /// Undo one level of suspension.
    pub fn resume_thread(&mut self, acting: CpuId, tid: Tid) -> Result {
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        if t.suspend_count == 0 {
            return Err(KX_ERR_BAD_STATE);
        }
        t.suspend_count -= 1;
        if t.suspend_count == 0 && t.state == ThreadState::Runnable && t.queued_level.is_none() {
            self.enqueue_thread(acting, tid);
        }
        Ok(())
    }

    /// ========================================================================
    /// Termination
    /// ========================================================================

    /// Request thread termination. The thread is pulled out of every
    /// queue, tree and wait list before its state flips, and threads
    /// blocked on locks it owns observe a canceled result instead of
    /// hanging.
    pub fn request_terminate(&mut self, acting: CpuId, tid: Tid) -> Result {
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        if t.state == ThreadState::Terminated {
            return Ok(());
        }
        t.flags.insert(ThreadFlags::TERMINATION_REQUESTED);
        let was_started = t.state != ThreadState::Initialized;

        self.unlink_wait(tid);
        if let Some(core) = self.threads.t(tid).queued_core {
            let st = &mut *self;
            st.cores[core as usize].run_queue.remove(&mut st.threads, tid);
        }

        // Lock waiters of a dying owner are woken with a canceled result
        // rather than left on a lock no one will release.
        let waiters = core::mem::take(&mut self.threads.t_mut(tid).lock_waiters);
        for w in waiters {
            let t = self.threads.t_mut(w);
            t.lock_owner = None;
            t.waiting_lock_key = None;
            self.make_runnable(acting, w, KX_ERR_CANCELED);
        }

        for core in 0..MAX_CORES {
            if self.cores[core].current == Some(tid) {
                self.cores[core].current = None;
                self.request_reschedule(acting, core as CpuId);
                if core as CpuId == acting {
                    self.select_next(acting);
                }
            }
        }

        let t = self.threads.t_mut(tid);
        t.state = ThreadState::Terminated;
        if was_started {
            t.ref_count -= 1; // scheduler reference
        }
        log_debug!("thread {} terminated", tid);
        Ok(())
    }

    /// Drop the owning process's reference; the table entry goes away once
    /// nothing references the thread.
    pub fn close_thread(&mut self, acting: CpuId, tid: Tid) -> Result {
        let t = self.threads.get_mut(tid).ok_or(KX_ERR_BAD_HANDLE)?;
        if t.state != ThreadState::Terminated {
            return Err(KX_ERR_BAD_STATE);
        }
        t.ref_count -= 1;
        if t.ref_count == 0 {
            self.threads.remove(tid);
            self.resource_release(acting, ResourceKind::Threads, 1);
        }
        Ok(())
    }

    /// ========================================================================
    /// Lock Waiter Machinery (priority inheritance)
    /// ========================================================================

    /// Park bookkeeping for a thread about to block on a lock `owner`
    /// holds: it joins the owner's waiter list in (priority, arrival)
    /// order and the owner inherits its priority if more urgent.
    pub(crate) fn add_lock_waiter(&mut self, owner: Tid, waiter: Tid, key: VAddr, tag: u32) {
        let seq = self.next_wait_seq();
        {
            let t = self.threads.t_mut(waiter);
            t.wait_seq = seq;
            t.waiting_lock_key = Some(key);
            t.lock_owner = Some(owner);
            t.lock_wait_tag = tag;
        }
        self.insert_lock_waiter_sorted(owner, waiter);
        self.refresh_inherited_priority(owner);
    }

    fn insert_lock_waiter_sorted(&mut self, owner: Tid, waiter: Tid) {
        let (wp, ws) = {
            let t = self.threads.t(waiter);
            (t.priority, t.wait_seq)
        };
        let mut list = core::mem::take(&mut self.threads.t_mut(owner).lock_waiters);
        let pos = list
            .iter()
            .position(|&w| {
                let t = self.threads.t(w);
                (t.priority, t.wait_seq) > (wp, ws)
            })
            .unwrap_or(list.len());
        list.insert(pos, waiter);
        self.threads.t_mut(owner).lock_waiters = list;
    }

    fn reposition_lock_waiter(&mut self, owner: Tid, waiter: Tid) {
        if self.threads.get(owner).is_none() {
            return;
        }
        let mut list = core::mem::take(&mut self.threads.t_mut(owner).lock_waiters);
        list.retain(|&w| w != waiter);
        self.threads.t_mut(owner).lock_waiters = list;
        self.insert_lock_waiter_sorted(owner, waiter);
    }

    /// Best waiter for `key` on `old_owner`, without mutating anything.
    pub(crate) fn peek_lock_waiter(&self, old_owner: Tid, key: VAddr) -> Option<(Tid, bool)> {
        let list = &self.threads.t(old_owner).lock_waiters;
        let mut iter = list
            .iter()
            .copied()
            .filter(|&w| self.threads.t(w).waiting_lock_key == Some(key));
        let next = iter.next()?;
        Some((next, iter.next().is_some()))
    }

    /// Hand a lock from `old_owner` to its best waiter for `key`. The
    /// remaining same-key waiters move onto the new owner, both threads'
    /// inherited priorities are re-derived, and the new owner is left for
    /// the caller to wake. Returns (new owner, waiters remain).
    pub(crate) fn transfer_lock_ownership(&mut self, old_owner: Tid, key: VAddr) -> Option<(Tid, bool)> {
        let (next, _) = self.peek_lock_waiter(old_owner, key)?;

        let mut list = core::mem::take(&mut self.threads.t_mut(old_owner).lock_waiters);
        list.retain(|&w| w != next);
        let moved: alloc::vec::Vec<Tid> = list
            .iter()
            .copied()
            .filter(|&w| self.threads.t(w).waiting_lock_key == Some(key))
            .collect();
        list.retain(|&w| self.threads.t(w).waiting_lock_key != Some(key));
        self.threads.t_mut(old_owner).lock_waiters = list;

        {
            let t = self.threads.t_mut(next);
            t.waiting_lock_key = None;
            t.lock_owner = None;
        }
        let has_more = !moved.is_empty();
        for w in moved {
            self.threads.t_mut(w).lock_owner = Some(next);
            self.insert_lock_waiter_sorted(next, w);
        }

        self.refresh_inherited_priority(old_owner);
        self.refresh_inherited_priority(next);
        Some((next, has_more))
    }

    /// Composite return value for a completed multi-object wait.
    pub fn sync_result(&self, tid: Tid) -> Status {
        let t = self.threads.t(tid);
        if t.wait_result == KX_OK {
            t.synced_index.map(|i| i as Status).unwrap_or(KX_OK)
        } else {
            t.wait_result
        }
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}
