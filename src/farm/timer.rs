//! Timer queue for the controller loop.
//!
//! Deadlines live in a min-heap; cancelling only forgets the timer's kind,
//! and stale heap entries are skipped when they surface.

use crate::worker::protocol::WorkerId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Handle to a scheduled timer.
pub type TimerId = u64;

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A call on this worker ran past its max call time.
    CallTimeout(WorkerId),
    /// The settle window after this worker's exit has passed.
    Settle(WorkerId),
    /// Retry dispatch after a failed worker start.
    RetryDispatch,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    pending: HashMap<TimerId, TimerKind>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.schedule_at(Instant::now() + delay, kind)
    }

    pub fn schedule_at(&mut self, deadline: Instant, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.push(Reverse((deadline, id)));
        self.pending.insert(id, kind);
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.pending.remove(&id);
    }

    /// Earliest deadline of a live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek() {
            if self.pending.contains_key(id) {
                return Some(*deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Remove and return the next live timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek() {
            if *deadline > now {
                return None;
            }
            let id = *id;
            self.deadlines.pop();
            if let Some(kind) = self.pending.remove(&id) {
                return Some(kind);
            }
        }
        None
    }
}
