// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Timeout Timers
//!
//! Deadline bookkeeping for every blocking call in the kernel. Deadlines
//! are absolute counts of the ARM generic timer; the platform programs
//! the per-core comparator for the earliest deadline and calls back into
//! `advance_ticks` from the timer interrupt. Expiry takes the scheduler
//! lock and performs the identical unlink-and-wake sequence as a signal,
//! so a timeout racing a wake resolves to whichever takes the lock first
//! and the loser's action is a no-op.
//!
//! At the ABI boundary timeouts are nanoseconds: negative means wait
//! forever, zero means already expired, positive converts (rounding up)
//! to an absolute tick deadline.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::KernelState;
use alloc::collections::BTreeSet;

use crate::log_trace;

/// Resolved timeout for a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until signaled or canceled.
    Infinite,
    /// The deadline already passed; do not park.
    Expired,
    /// Park until this absolute tick count.
    Deadline(Tick),
}

/// Convert a caller-supplied nanosecond timeout into a deadline.
pub fn timeout_from_ns(now: Tick, timeout_ns: Nanoseconds) -> Timeout {
    if timeout_ns < 0 {
        Timeout::Infinite
    } else if timeout_ns == 0 {
        Timeout::Expired
    } else {
        Timeout::Deadline(now.saturating_add(ns_to_ticks(timeout_ns as u64)))
    }
}

/// Nanoseconds to ticks, rounded up so a timed wait never wakes early.
pub fn ns_to_ticks(ns: u64) -> Tick {
    let product = ns as u128 * TICKS_PER_SECOND as u128;
    product.div_ceil(1_000_000_000) as Tick
}

/// Ticks to nanoseconds, rounded down.
pub fn ticks_to_ns(ticks: Tick) -> u64 {
    (ticks as u128 * 1_000_000_000 / TICKS_PER_SECOND as u128) as u64
}

/// ============================================================================
/// Timer Queue
/// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Tick,
    seq: u64,
    tid: Tid,
}

/// Deadline-ordered queue of parked threads with finite timeouts.
pub struct TimerQueue {
    now: Tick,
    seq: u64,
    entries: BTreeSet<TimerEntry>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            now: 0,
            seq: 0,
            entries: BTreeSet::new(),
        }
    }

    /// Current monotonic tick count.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Earliest armed deadline; what the platform programs the hardware
    /// comparator to.
    pub fn next_deadline(&self) -> Option<Tick> {
        self.entries.iter().next().map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arm a timeout for `tid`. Returns the key the thread stores for
    /// cancellation.
    pub(crate) fn arm(&mut self, tid: Tid, deadline: Tick) -> (Tick, u64) {
        self.seq += 1;
        let seq = self.seq;
        self.entries.insert(TimerEntry { deadline, seq, tid });
        (deadline, seq)
    }

    /// Disarm a previously armed timeout.
    pub(crate) fn cancel(&mut self, tid: Tid, key: (Tick, u64)) {
        self.entries.remove(&TimerEntry {
            deadline: key.0,
            seq: key.1,
            tid,
        });
    }

    fn pop_due(&mut self) -> Option<TimerEntry> {
        let first = *self.entries.iter().next()?;
        if first.deadline > self.now {
            return None;
        }
        self.entries.remove(&first);
        Some(first)
    }
}

impl KernelState {
    /// Advance the clock and deliver `KX_ERR_TIMED_OUT` to every wait
    /// whose deadline passed. Called from the per-core timer interrupt
    /// (and directly by host harnesses).
    pub fn advance_ticks(&mut self, acting: CpuId, dt: Tick) {
        self.timer.now = self.timer.now.saturating_add(dt);
        while let Some(entry) = self.timer.pop_due() {
            if let Some(t) = self.threads.get_mut(entry.tid) {
                // The wake key must still match; a stale entry means a
                // signal got here first and this expiry is a no-op.
                if t.timer_key == Some((entry.deadline, entry.seq)) {
                    t.timer_key = None;
                    log_trace!("thread {} timed out", entry.tid);
                    self.cancel_wait(acting, entry.tid, KX_ERR_TIMED_OUT);
                }
            }
        }
    }

    /// Nanosecond convenience over [`advance_ticks`], rounding down.
    pub fn advance_ns(&mut self, acting: CpuId, ns: u64) {
        self.advance_ticks(acting, (ns as u128 * TICKS_PER_SECOND as u128 / 1_000_000_000) as Tick);
    }
}

// ============================================================================
// Tests
// ============================================================================
