use crate::scheduler::{Dispatch, Entry, Progress, RequestKey, Scheduler};
use std::collections::VecDeque;

/// First come, first served. Each request runs to completion in one slice.
pub struct Fcfs {
    q: VecDeque<Entry>,
}

impl Fcfs {
    pub fn new() -> Self {
        Self { q: VecDeque::new() }
    }
}

impl Default for Fcfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for Fcfs {
    fn push(&mut self, entry: Entry) {
        self.q.push_back(entry);
    }

    fn pop(&mut self) -> Option<Dispatch> {
        self.q.pop_front().map(|e| Dispatch {
            key: e.key,
            slice: e.service,
        })
    }

    fn observe(&mut self, _key: RequestKey, _served: u64) -> Progress {
        Progress::Done
    }

    // since FCFS doesn't have state, nothing to do here
    fn clear_state(&mut self, _key: RequestKey) {}

    fn is_runnable(&self) -> bool {
        !self.q.is_empty()
    }

    fn len(&self) -> usize {
        self.q.len()
    }
}
