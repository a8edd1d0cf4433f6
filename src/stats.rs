/// Fixed log2 histogram for values in clock units.
/// Buckets: [0..1], [1..2], [2..4], ..., up to 2^63.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Log2Histogram {
    pub buckets: [u64; 64],
    pub count: u64,
    pub sum: u128,
    pub max: u64,
}

impl Log2Histogram {
    pub const fn new() -> Self {
        Self {
            buckets: [0; 64],
            count: 0,
            sum: 0,
            max: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, v: u64) {
        let idx = if v == 0 {
            0
        } else {
            63 - v.leading_zeros() as usize
        };
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum += v as u128;
        if v > self.max {
            self.max = v;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }
}

impl Default for Log2Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-wide stats. Only the worker thread writes these; readers get a
/// snapshot through `Server::stats`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerStats {
    // Lifecycle, in clock units
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,

    // Flow
    pub submitted: u64,
    pub dispatches: u64,
    pub completions: u64,
    pub requeues: u64, // RR slices that ended with service left
    pub abandoned: u64, // pending or in service at shutdown

    // Service accounting
    pub busy: u64,                  // units spent servicing
    pub queue_delay: Log2Histogram, // queued stretch before each slice
    pub slice: Log2Histogram,       // length of each slice

    // Pending set size, sampled once per dispatch
    pub pending_samples: u64,
    pub pending_sum: u64,
    pub pending_max: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_start(&mut self, now: u64) {
        self.started_at = Some(now);
    }

    pub(crate) fn record_stop(&mut self, now: u64, abandoned: u64) {
        self.stopped_at = Some(now);
        self.abandoned += abandoned;
    }

    #[inline]
    pub(crate) fn record_dispatch(&mut self, queued: u64, slice: u64) {
        self.dispatches += 1;
        self.queue_delay.record(queued);
        self.slice.record(slice);
    }

    #[inline]
    pub(crate) fn record_served(&mut self, units: u64) {
        self.busy += units;
    }

    #[inline]
    pub(crate) fn record_completion(&mut self) {
        self.completions += 1;
    }

    #[inline]
    pub(crate) fn record_requeue(&mut self) {
        self.requeues += 1;
    }

    #[inline]
    pub(crate) fn sample_pending(&mut self, len: u64) {
        self.pending_samples += 1;
        self.pending_sum += len;
        if len > self.pending_max {
            self.pending_max = len;
        }
    }

    /// Fraction of the running time spent servicing requests.
    pub fn utilization(&self) -> Option<f64> {
        let span = self.stopped_at?.checked_sub(self.started_at?)?;
        if span == 0 {
            return None;
        }
        Some(self.busy as f64 / span as f64)
    }

    pub fn mean_pending(&self) -> f64 {
        if self.pending_samples == 0 {
            return 0.0;
        }
        self.pending_sum as f64 / self.pending_samples as f64
    }
}
