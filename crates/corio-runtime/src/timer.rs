//! Timer wheel.
//!
//! Orders deferred tasks by `(deadline, id)` and reports the expired
//! ones. Backed by a binary min-heap with lazy cancellation: cancelled
//! ids go into a set and are skipped when they surface, which keeps
//! cancel O(1) instead of O(n) heap surgery. The set is cleared whenever
//! the heap drains empty.
//!
//! The wheel is not synchronized; the owning context guards it with its
//! own mutex.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use corio_core::{Task, TimerId};

struct Entry {
    id: u64,
    deadline: Instant,
    task: Task,
}

/// Reverse ordering for a min-heap; ties break on ascending id, which is
/// insertion order since ids are monotonic.
struct HeapEntry(Entry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match other.0.deadline.cmp(&self.0.deadline) {
            CmpOrdering::Equal => other.0.id.cmp(&self.0.id),
            ord => ord,
        }
    }
}

/// Deadline-ordered store of deferred tasks.
pub struct TimerWheel {
    heap: BinaryHeap<HeapEntry>,
    /// Ids that are armed and not yet fired or cancelled.
    live: HashSet<u64>,
    /// Ids cancelled but still sitting in the heap.
    cancelled: HashSet<u64>,
    /// Entries with `delay == Duration::MAX`: valid placeholders that
    /// never fire and can only be cleared.
    parked: HashMap<u64, Task>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            parked: HashMap::new(),
            next_id: 1,
        }
    }

    /// Arm a timer `delay` from now. `Duration::MAX` never fires.
    pub fn set_timeout(&mut self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        match Instant::now().checked_add(delay) {
            Some(deadline) => {
                self.live.insert(id);
                self.heap.push(HeapEntry(Entry { id, deadline, task }));
            }
            None => {
                self.parked.insert(id, task);
            }
        }
        TimerId(id)
    }

    /// Cancel a timer. Returns whether a pending entry was removed;
    /// unknown or already-fired ids are a no-op.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.parked.remove(&id.0).is_some() {
            return true;
        }
        if self.live.remove(&id.0) {
            self.cancelled.insert(id.0);
            return true;
        }
        false
    }

    /// The earliest live deadline, or `None` when nothing can fire.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.skip_cancelled();
        self.heap.peek().map(|e| e.0.deadline)
    }

    /// Remove and return all tasks with `deadline <= now`, in
    /// `(deadline, id)` order. Tasks are returned, not invoked.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Task> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap().0;
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            self.live.remove(&entry.id);
            expired.push(entry.task);
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
        expired
    }

    /// Armed, uncancelled timers (parked placeholders included).
    pub fn len(&self) -> usize {
        self.live.len() + self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop cancelled entries sitting at the front so `next_deadline`
    /// reports a deadline that will actually fire.
    fn skip_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.contains(&top.0.id) {
                let entry = self.heap.pop().unwrap().0;
                self.cancelled.remove(&entry.id);
            } else {
                break;
            }
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
