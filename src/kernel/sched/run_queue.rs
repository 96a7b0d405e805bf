// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-Core Run Queue
//!
//! A multi-level queue: one FIFO list per priority level plus a bitmap of
//! occupied levels, so "find the highest occupied level" is a single
//! trailing-zeros. The lists are intrusive; they chase the link fields
//! embedded in each thread control block through the thread table, and no
//! operation allocates.

use crate::kapi::types::*;
use crate::kernel::thread::ThreadTable;

/// One FIFO level.
#[derive(Debug, Clone, Copy)]
struct Level {
    head: Option<Tid>,
    tail: Option<Tid>,
}

impl Level {
    const EMPTY: Level = Level { head: None, tail: None };
}

/// Run queue for a single core.
///
/// Invariant: a thread is linked here iff it is Runnable, not suspended,
/// not the core's current thread, and its `queued_level` equals its
/// current priority.
pub struct RunQueue {
    levels: [Level; PRIORITY_COUNT],
    occupied: u64,
    core: CpuId,
}

impl RunQueue {
    pub(crate) const fn new(core: CpuId) -> Self {
        Self {
            levels: [Level::EMPTY; PRIORITY_COUNT],
            occupied: 0,
            core,
        }
    }

    /// Lowest-numbered (most urgent) occupied level.
    pub fn highest_level(&self) -> Option<Priority> {
        if self.occupied == 0 {
            None
        } else {
            Some(self.occupied.trailing_zeros() as Priority)
        }
    }

    /// Head of the highest occupied level.
    pub fn front(&self) -> Option<Tid> {
        self.highest_level().and_then(|l| self.levels[l as usize].head)
    }

    /// Head of one specific level.
    pub fn front_of(&self, level: Priority) -> Option<Tid> {
        self.levels[level as usize].head
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Link `tid` at the tail of its current priority level.
    pub fn push_back(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let (prio, old_tail) = self.link_prepare(threads, tid);
        let level = &mut self.levels[prio as usize];
        if let Some(tail) = old_tail {
            threads.t_mut(tail).run_next = Some(tid);
            threads.t_mut(tid).run_prev = Some(tail);
            level.tail = Some(tid);
        } else {
            level.head = Some(tid);
            level.tail = Some(tid);
        }
        self.occupied |= 1 << prio;
    }

    /// Link `tid` at the head of its current priority level. Used when a
    /// thread is preempted mid-turn so it resumes before its level peers.
    pub fn push_front(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let prio = {
            let t = threads.t_mut(tid);
            if t.queued_level.is_some() {
                panic!("run queue: thread {} already queued", tid);
            }
            let prio = t.priority;
            t.queued_level = Some(prio);
            t.queued_core = Some(self.core);
            t.current_core = self.core;
            prio
        };
        let old_head = self.levels[prio as usize].head;
        let level = &mut self.levels[prio as usize];
        if let Some(head) = old_head {
            threads.t_mut(head).run_prev = Some(tid);
            threads.t_mut(tid).run_next = Some(head);
            level.head = Some(tid);
        } else {
            level.head = Some(tid);
            level.tail = Some(tid);
        }
        self.occupied |= 1 << prio;
    }

    /// Unlink `tid` from wherever it sits in this queue.
    pub fn remove(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let (prev, next, prio) = {
            let t = threads.t_mut(tid);
            let prio = match t.queued_level.take() {
                Some(p) => p,
                None => panic!("run queue: removing unqueued thread {}", tid),
            };
            match t.queued_core.take() {
                Some(c) if c == self.core => {}
                _ => panic!("run queue: thread {} queued on another core", tid),
            }
            (t.run_prev.take(), t.run_next.take(), prio)
        };

        let level = prio as usize;
        match prev {
            Some(p) => threads.t_mut(p).run_next = next,
            None => self.levels[level].head = next,
        }
        match next {
            Some(n) => threads.t_mut(n).run_prev = prev,
            None => self.levels[level].tail = prev,
        }
        if self.levels[level].head.is_none() {
            self.occupied &= !(1 << prio);
        }
    }

    /// Unlink and return the head of the highest occupied level.
    pub fn pop_front(&mut self, threads: &mut ThreadTable) -> Option<Tid> {
        let tid = self.front()?;
        self.remove(threads, tid);
        Some(tid)
    }

    fn link_prepare(&mut self, threads: &mut ThreadTable, tid: Tid) -> (Priority, Option<Tid>) {
        let t = threads.t_mut(tid);
        if t.queued_level.is_some() {
            panic!("run queue: thread {} already queued", tid);
        }
        let prio = t.priority;
        if prio as usize >= PRIORITY_COUNT {
            panic!("run queue: thread {} has priority {} out of range", tid, prio);
        }
        t.queued_level = Some(prio);
        t.queued_core = Some(self.core);
        t.current_core = self.core;
        (prio, self.levels[prio as usize].tail)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::thread::ThreadState;

    fn table_with(prios: &[Priority]) -> (ThreadTable, alloc::vec::Vec<Tid>) {
        let mut table = ThreadTable::new();
        let mut tids = alloc::vec::Vec::new();
        for &p in prios {
            let tid = table.create(1, p, CPU_MASK_ALL, 0);
            table.t_mut(tid).state = ThreadState::Runnable;
            tids.push(tid);
        }
        (table, tids)
    }

    #[test]
    fn test_highest_level_ordering() {
        let (mut table, tids) = table_with(&[30, 10, 20]);
        let mut rq = RunQueue::new(0);
        for &tid in &tids {
            rq.push_back(&mut table, tid);
        }

        assert_eq!(rq.highest_level(), Some(10));
        assert_eq!(rq.pop_front(&mut table), Some(tids[1]));
        assert_eq!(rq.pop_front(&mut table), Some(tids[2]));
        assert_eq!(rq.pop_front(&mut table), Some(tids[0]));
        assert_eq!(rq.pop_front(&mut table), None);
        assert!(rq.is_empty());
    }

    #[test]
    fn test_fifo_within_level() {
        let (mut table, tids) = table_with(&[16, 16, 16]);
        let mut rq = RunQueue::new(0);
        for &tid in &tids {
            rq.push_back(&mut table, tid);
        }
        assert_eq!(rq.pop_front(&mut table), Some(tids[0]));
        assert_eq!(rq.pop_front(&mut table), Some(tids[1]));
        assert_eq!(rq.pop_front(&mut table), Some(tids[2]));
    }

    #[test]
    fn test_push_front_resumes_first() {
        let (mut table, tids) = table_with(&[16, 16]);
        let mut rq = RunQueue::new(0);
        rq.push_back(&mut table, tids[0]);
        rq.push_front(&mut table, tids[1]);
        assert_eq!(rq.pop_front(&mut table), Some(tids[1]));
        assert_eq!(rq.pop_front(&mut table), Some(tids[0]));
    }

    #[test]
    fn test_remove_middle() {
        let (mut table, tids) = table_with(&[16, 16, 16]);
        let mut rq = RunQueue::new(0);
        for &tid in &tids {
            rq.push_back(&mut table, tid);
        }
        rq.remove(&mut table, tids[1]);
        assert_eq!(rq.pop_front(&mut table), Some(tids[0]));
        assert_eq!(rq.pop_front(&mut table), Some(tids[2]));
        assert!(rq.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_double_link_is_fatal() {
        let (mut table, tids) = table_with(&[16]);
        let mut rq = RunQueue::new(0);
        rq.push_back(&mut table, tids[0]);
        rq.push_back(&mut table, tids[0]);
    }
}
