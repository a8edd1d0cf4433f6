use crate::scheduler::{Dispatch, Entry, Progress, RequestKey, Scheduler};
use ahash::AHashMap as HashMap;
use std::collections::VecDeque;
use std::num::NonZeroU64;

/// Round robin with a fixed quantum.
/// A request needing `s` units is dispatched ceil(s / quantum) times; every
/// slice is a full quantum except possibly the last.
pub struct RoundRobin {
    quantum: u64,
    ready: VecDeque<RequestKey>,
    // remaining service for every request that is pending or being serviced
    remaining: HashMap<RequestKey, u64>,
}

impl RoundRobin {
    pub fn new(quantum: NonZeroU64) -> Self {
        Self {
            quantum: quantum.get(),
            ready: VecDeque::new(),
            remaining: HashMap::new(),
        }
    }

    pub fn quantum(&self) -> u64 {
        self.quantum
    }
}

impl Scheduler for RoundRobin {
    fn push(&mut self, entry: Entry) {
        // a requeued request keeps the remaining time it already has
        self.remaining.entry(entry.key).or_insert(entry.service);
        self.ready.push_back(entry.key);
    }

    fn pop(&mut self) -> Option<Dispatch> {
        let key = self.ready.pop_front()?;
        let remaining = self.remaining.get(&key).map_or(0, |r| *r);
        Some(Dispatch {
            key,
            slice: remaining.min(self.quantum),
        })
    }

    fn observe(&mut self, key: RequestKey, served: u64) -> Progress {
        let Some(remaining) = self.remaining.get_mut(&key) else {
            return Progress::Done;
        };
        *remaining = remaining.saturating_sub(served);
        if *remaining == 0 {
            self.remaining.remove(&key);
            return Progress::Done;
        }
        Progress::Remaining(*remaining)
    }

    fn clear_state(&mut self, key: RequestKey) {
        self.remaining.remove(&key);
    }

    fn is_runnable(&self) -> bool {
        !self.ready.is_empty()
    }

    fn len(&self) -> usize {
        self.ready.len()
    }
}
