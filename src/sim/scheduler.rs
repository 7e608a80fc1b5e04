//! Discrete-event scheduler
//!
//! Events fire in timestamp order; events with equal timestamps fire in
//! registration order. Nothing here reorders packets.

use crate::sim::Clock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle for cancelling a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(u64);

struct Scheduled<E> {
    at: Duration,
    seq: u64,
    event: E,
}

// Reverse ordering on (at, seq) turns the max-heap into earliest-first.
impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Event queue driving the simulation.
pub struct Scheduler<E> {
    clock: Clock,
    queue: BinaryHeap<Scheduled<E>>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl<E> Scheduler<E> {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule `event` to fire `delay` after the current time.
    pub fn schedule(&mut self, delay: Duration, event: E) -> EventToken {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Scheduled {
            at: self.clock.now() + delay,
            seq,
            event,
        });
        EventToken(seq)
    }

    /// Cancel a previously scheduled event. Cancelling an event that
    /// already fired is a no-op.
    pub fn cancel(&mut self, token: EventToken) {
        self.cancelled.insert(token.0);
    }

    /// Pop the next event, advancing the clock to its timestamp.
    pub fn pop(&mut self) -> Option<(Duration, E)> {
        while let Some(scheduled) = self.queue.pop() {
            if self.cancelled.remove(&scheduled.seq) {
                continue;
            }
            self.clock.advance_to(scheduled.at);
            return Some((scheduled.at, scheduled.event));
        }
        None
    }

    /// Timestamp of the next pending event, if any.
    pub fn peek_time(&mut self) -> Option<Duration> {
        loop {
            let (at, seq) = match self.queue.peek() {
                Some(scheduled) => (scheduled.at, scheduled.seq),
                None => return None,
            };
            if self.cancelled.contains(&seq) {
                self.queue.pop();
                self.cancelled.remove(&seq);
                continue;
            }
            return Some(at);
        }
    }

    pub fn is_empty(&mut self) -> bool {
        self.peek_time().is_none()
    }
}
