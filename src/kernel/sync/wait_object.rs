// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization-Object Protocol
//!
//! The generic wait-list and signal mechanism shared by every blockable
//! kernel object. An object is a signaled flag plus an ordered list of
//! parked threads; `wait_synchronization` links one thread onto several
//! objects at once, and `notify_available` wakes every satisfied waiter
//! in (priority, arrival) order, unlinking each from all the objects it
//! was also waiting on.
//!
//! # Design
//!
//! - **Level-triggered**: a signaled object satisfies waits immediately
//!   at entry, without parking
//! - **Priority-ordered wakeup**: wait lists are kept sorted, FIFO within
//!   a priority level
//! - **Multi-wait**: the woken thread learns the index of the object that
//!   satisfied it

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::{KernelState, Outcome};
use crate::kernel::thread::ThreadTable;
use crate::kernel::timer::Timeout;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::log_trace;

/// A blockable kernel object: the signaled flag and its wait list.
pub struct SyncObject {
    pub id: ObjId,
    pub signaled: bool,
    /// Parked threads in (priority, arrival) order
    pub(crate) waiters: Vec<Tid>,
}

impl SyncObject {
    /// The signal predicate every waiter re-checks at wait entry.
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Table of signalable objects.
pub struct ObjectTable {
    entries: BTreeMap<ObjId, SyncObject>,
    next: ObjId,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
        }
    }

    pub(crate) fn create(&mut self) -> ObjId {
        let id = self.next;
        self.next += 1;
        self.entries.insert(
            id,
            SyncObject {
                id,
                signaled: false,
                waiters: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: ObjId) -> Option<&SyncObject> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ObjId) -> Option<&mut SyncObject> {
        self.entries.get_mut(&id)
    }
}

/// Insert `tid` into a wait list, keeping (priority, arrival) order.
pub(crate) fn insert_waiter_sorted(threads: &ThreadTable, waiters: &mut Vec<Tid>, tid: Tid) {
    let t = threads.t(tid);
    let key = (t.priority, t.wait_seq);
    let pos = waiters
        .iter()
        .position(|&w| {
            let wt = threads.t(w);
            (wt.priority, wt.wait_seq) > key
        })
        .unwrap_or(waiters.len());
    waiters.insert(pos, tid);
}

impl KernelState {
    /// Wait until one of `objects` is signaled.
    ///
    /// Returns the index of an already-signaled object without parking;
    /// with nothing signaled and a zero timeout the call is an immediate
    /// `KX_ERR_TIMED_OUT`. Otherwise the calling thread is linked onto
    /// every object's wait list and parks; the wake path stores the
    /// signaled object's index, read back through `sync_result`.
    pub fn wait_synchronization(&mut self, core: CpuId, objects: &[ObjId], timeout: Timeout) -> Outcome {
        if objects.is_empty() || objects.len() > MAX_WAIT_OBJECTS {
            return Outcome::Done(KX_ERR_OUT_OF_RANGE);
        }
        let curr = self.current_tid(core);
        if self.threads.t(curr).is_termination_requested() {
            return Outcome::Done(KX_ERR_TERMINATION_REQUESTED);
        }

        for (i, &oid) in objects.iter().enumerate() {
            match self.objects.get(oid) {
                Some(obj) if obj.is_signaled() => {
                    return Outcome::Done(i as Status);
                }
                Some(_) => {}
                None => return Outcome::Done(KX_ERR_BAD_HANDLE),
            }
        }
        if timeout == Timeout::Expired {
            return Outcome::Done(KX_ERR_TIMED_OUT);
        }

        let seq = self.next_wait_seq();
        self.threads.t_mut(curr).wait_seq = seq;
        {
            let st = &mut *self;
            for &oid in objects {
                let obj = st.objects.get_mut(oid).unwrap_or_else(|| {
                    panic!("wait list: object {} vanished under the scheduler lock", oid)
                });
                insert_waiter_sorted(&st.threads, &mut obj.waiters, curr);
            }
            st.threads.t_mut(curr).wait_objects = objects.to_vec();
        }
        log_trace!("thread {} waits on {} objects", curr, objects.len());
        self.block_current(core, timeout);
        Outcome::Parked
    }

    /// Signal delivery: wake every waiter of `oid` in list order with
    /// `result`, recording for each the index it was waiting under. A
    /// woken thread that beats its core's current thread triggers a
    /// preemption request there.
    pub(crate) fn notify_available(&mut self, acting: CpuId, oid: ObjId, result: Status) {
        let waiters = match self.objects.get_mut(oid) {
            Some(obj) => core::mem::take(&mut obj.waiters),
            None => return,
        };
        for w in waiters {
            let index = self.threads.t(w).wait_objects.iter().position(|&o| o == oid);
            self.threads.t_mut(w).synced_index = index;
            self.make_runnable(acting, w, result);
        }
    }

    /// Deliver `KX_ERR_CANCELED` to a thread parked in a multi-object
    /// wait.
    pub fn cancel_synchronization(&mut self, acting: CpuId, tid: Tid) -> Result {
        match self.threads.get(tid) {
            Some(t) if !t.wait_objects.is_empty() => {}
            Some(_) => return Err(KX_ERR_INVALID_STATE),
            None => return Err(KX_ERR_BAD_HANDLE),
        }
        self.cancel_wait(acting, tid, KX_ERR_CANCELED);
        Ok(())
    }
}
