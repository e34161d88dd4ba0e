//! Scheduler priority queue (spec §4.1)
//!
//! A standard binary min-heap keyed by due-time, ties broken by insertion
//! order. Only push/pop/peek are required (see SPEC_FULL.md / DESIGN.md
//! for why the heap-index-maintenance design note is not implemented).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::StatKey;

/// One bucket of regularly-scheduled keys sharing an effective interval.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub interval: Duration,
    pub keys: Vec<StatKey>,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    RegularBucket(Bucket),
    ProtocolSummary,
    ClientSummary,
}

impl TaskKind {
    pub fn cadence(&self) -> Duration {
        match self {
            TaskKind::RegularBucket(b) => b.interval,
            TaskKind::ProtocolSummary | TaskKind::ClientSummary => Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub due: DateTime<Utc>,
    pub kind: TaskKind,
}

impl ScheduledTask {
    pub fn reschedule(&mut self) {
        let cadence = chrono::Duration::from_std(self.kind.cadence()).unwrap_or(chrono::Duration::zero());
        self.due += cadence;
    }
}

struct HeapEntry {
    due: DateTime<Utc>,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) behaves as a min-heap on due,
        // then on insertion sequence to keep ties stable.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of `ScheduledTask`s ordered by `due`.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, task: ScheduledTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            due: task.due,
            seq,
            task,
        });
    }

    pub fn pop(&mut self) -> Option<ScheduledTask> {
        self.heap.pop().map(|e| e.task)
    }

    pub fn peek(&self) -> Option<&ScheduledTask> {
        self.heap.peek().map(|e| &e.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
