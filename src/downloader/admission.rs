//! Admission control: concurrency ceiling plus a priority wait queue.

use std::collections::{BinaryHeap, HashSet};

use crate::types::{Priority, TaskId};

/// Entry in the wait queue
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct QueuedTask {
    pub(crate) id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
}

// Max-heap: higher priority first, then lower sequence number (FIFO)
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of asking for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Start now
    Admitted,
    /// Wait in the queue
    Queued,
}

/// In-flight set and wait queue; always accessed under the downloader's lock
#[derive(Debug)]
pub(crate) struct AdmissionQueue {
    limit: Option<usize>,
    in_flight: HashSet<TaskId>,
    waiting: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

impl AdmissionQueue {
    /// `None` means unlimited
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            in_flight: HashSet::new(),
            waiting: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.limit.is_none_or(|limit| self.in_flight.len() < limit)
    }

    /// Take a slot or join the queue
    pub(crate) fn admit(&mut self, id: TaskId, priority: Priority) -> Admission {
        if self.has_capacity() {
            self.in_flight.insert(id);
            Admission::Admitted
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.waiting.push(QueuedTask { id, priority, seq });
            Admission::Queued
        }
    }

    /// Give back the slot held by `id` and promote waiting tasks into free slots
    pub(crate) fn release(&mut self, id: TaskId) -> Vec<TaskId> {
        self.in_flight.remove(&id);
        let mut promoted = Vec::new();
        while self.has_capacity() {
            let Some(next) = self.waiting.pop() else {
                break;
            };
            self.in_flight.insert(next.id);
            promoted.push(next.id);
        }
        promoted
    }

    /// Drop a task from the wait queue; returns whether it was queued
    pub(crate) fn remove_waiting(&mut self, id: TaskId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|queued| queued.id != id);
        self.waiting.len() < before
    }

    pub(crate) fn is_in_flight(&self, id: TaskId) -> bool {
        self.in_flight.contains(&id)
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}
