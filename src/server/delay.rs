//! Deferred response scheduling
//!
//! A per-worker timer heap holding response writes delayed by the
//! configured amount. Entries are keyed by connection identity: when the
//! timer fires for a connection that has since closed, the write silently
//! evaporates instead of touching a disposed transport. Ordering is
//! (deadline, sequence), so two responses for the same connection fire in
//! the order their requests arrived.

use crate::http::HttpResponse;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Worker-local connection identity
pub type ConnId = u64;

/// A response write waiting for its deadline
#[derive(Debug)]
pub enum WriteTask {
    /// Pre-serialized HTTP/1.1 response plus the keep-alive decision
    /// captured at request time
    Http1 { wire: Vec<u8>, keep_alive: bool },
    /// Built response to frame onto an HTTP/2 stream
    Http2 {
        stream_id: u32,
        response: HttpResponse,
    },
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    conn_id: ConnId,
    task: WriteTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Timer heap for deferred response writes
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl DelayQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        DelayQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Schedule a write `delay` from now for the given connection
    pub fn schedule(&mut self, conn_id: ConnId, delay: Duration, task: WriteTask) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            conn_id,
            task,
        }));
    }

    /// The earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop the next entry whose deadline has passed
    pub fn pop_due(&mut self, now: Instant) -> Option<(ConnId, WriteTask)> {
        if self.heap.peek().map(|Reverse(e)| e.deadline <= now)? {
            let Reverse(entry) = self.heap.pop()?;
            Some((entry.conn_id, entry.task))
        } else {
            None
        }
    }

    /// Whether any writes are pending
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
