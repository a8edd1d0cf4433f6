use crate::scheduler::{Dispatch, Entry, Progress, RequestKey, Scheduler};
use std::collections::BTreeMap;

/// Shortest job first, non-preemptive.
/// Pending requests are keyed by (total service, submission seq), so equal
/// service times come out in submission order.
pub struct Sjf {
    pending: BTreeMap<(u64, u64), RequestKey>,
}

impl Sjf {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl Default for Sjf {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for Sjf {
    fn push(&mut self, entry: Entry) {
        self.pending.insert((entry.service, entry.seq), entry.key);
    }

    fn pop(&mut self) -> Option<Dispatch> {
        let ((service, _seq), key) = self.pending.pop_first()?;
        Some(Dispatch {
            key,
            slice: service,
        })
    }

    fn observe(&mut self, _key: RequestKey, _served: u64) -> Progress {
        Progress::Done
    }

    fn clear_state(&mut self, _key: RequestKey) {}

    fn is_runnable(&self) -> bool {
        !self.pending.is_empty()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}
