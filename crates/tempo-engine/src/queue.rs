//! Time-ordered timer storage
//!
//! Timers live in a min-heap keyed by `(ready_at, seq)`; the seq tie-break
//! keeps equal-deadline timers in enqueue order. Readiness is evaluated
//! lazily at timer-phase entry against a snapshot of the clock and the
//! enqueue counter.

use crate::task::{Task, TaskId};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Entry in the timer heap
struct TimerEntry {
    ready_at: Instant,
    seq: u64,
    task: Task,
}

// Reverse ordering for min-heap (earliest deadline first, then enqueue order)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Min-heap of pending timers keyed by `(ready_at, seq)`.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Push a timer task; eligibility comes from its `ready_at` deadline.
    pub fn push(&mut self, task: Task) {
        let ready_at = task.ready_at.expect("timer task without a deadline");
        let seq = task.seq;
        self.heap.push(TimerEntry {
            ready_at,
            seq,
            task,
        });
    }

    /// Pop the earliest timer that is ready at `now` and was enqueued
    /// before `seq_limit`.
    ///
    /// Entries enqueued at or after `seq_limit` never have an earlier
    /// deadline than an eligible one (their `ready_at` is at least the
    /// clock reading at enqueue time), so stopping at the first blocked
    /// entry is sound.
    pub fn pop_ready(&mut self, now: Instant, seq_limit: u64) -> Option<Task> {
        let entry = self.heap.peek()?;
        if entry.ready_at <= now && entry.seq < seq_limit {
            Some(self.heap.pop().unwrap().task)
        } else {
            None
        }
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.ready_at)
    }

    /// True if the earliest pending timer is ready at `now`.
    pub fn has_ready(&self, now: Instant) -> bool {
        self.heap.peek().is_some_and(|entry| entry.ready_at <= now)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Drop cancelled entries off the top of the heap so the loop never
    /// parks for a deadline nobody is waiting on.
    pub fn purge_cancelled(&mut self, cancelled: &mut FxHashSet<TaskId>) {
        loop {
            let cancelled_top = self
                .heap
                .peek()
                .is_some_and(|entry| cancelled.contains(&entry.task.id));
            if !cancelled_top {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                cancelled.remove(&entry.task.id);
            }
        }
    }
}
