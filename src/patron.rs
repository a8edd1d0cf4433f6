//! Producers for the server: patrons that order a few drinks, wait for them
//! in order, and report how long it took.

use crate::{drink::Drink, error::SubmitError, request::Request, server::Server};
use log::info;
use rand::Rng;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use tabled::Tabled;

/// Per-patron timings, in clock units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Tabled)]
pub struct PatronMetrics {
    #[tabled(rename = "patron")]
    pub id: usize,
    /// Arrival delay after the start gate.
    pub arrival: u64,
    /// Submission start to the last drink's completion.
    pub turnaround: u64,
    /// Submission start to the first drink's first service.
    pub response: u64,
    /// Sum of the time each drink spent queued.
    pub waiting: u64,
}

impl fmt::Display for PatronMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}",
            self.id, self.arrival, self.turnaround, self.response, self.waiting
        )
    }
}

pub struct Patron {
    id: usize,
    arrival: u64,
    order: Vec<Arc<Request>>,
}

impl Patron {
    /// A patron ordering 1 to 5 random drinks, arriving `rand(0..300) + id * 100`
    /// units after the gate opens.
    pub fn new(id: usize, rng: &mut impl Rng) -> Self {
        let drinks = rng.gen_range(1..=5);
        let arrival = rng.gen_range(0..300) + id as u64 * 100;
        let order = (0..drinks)
            .map(|_| Arc::new(Request::for_drink(id, Drink::random(&mut *rng))))
            .collect();
        Self { id, arrival, order }
    }

    pub fn with_order(id: usize, arrival: u64, drinks: &[Drink]) -> Self {
        let order = drinks
            .iter()
            .map(|&d| Arc::new(Request::for_drink(id, d)))
            .collect();
        Self { id, arrival, order }
    }

    pub fn id(&self) -> usize {
        self.id
    }
    pub fn arrival(&self) -> u64 {
        self.arrival
    }
    pub fn order(&self) -> &[Arc<Request>] {
        &self.order
    }

    /// Place the whole order for `arrival` units from now, pass the gate,
    /// then wait on each drink in the order it was placed.
    ///
    /// Orders go in before the gate, so a worker behind the same gate sees
    /// every patron's order before it serves anything.
    pub fn run(self, server: &Server, gate: Option<&Barrier>) -> Result<PatronMetrics, SubmitError> {
        let start = server.now() + self.arrival;
        info!(
            "patron {} ordering {} drinks for {}",
            self.id,
            self.order.len(),
            start
        );
        let placed = self
            .order
            .iter()
            .try_for_each(|req| server.submit_at(req.clone(), start));
        // pass the gate even on failure so nobody else waits forever
        if let Some(gate) = gate {
            gate.wait();
        }
        placed?;

        let mut response = None;
        let mut waiting = 0;
        let mut finished = start;
        for req in &self.order {
            req.wait();
            let started = req.start_time().unwrap_or(start);
            if response.is_none() {
                response = Some(started.saturating_sub(start));
            }
            waiting += req.waiting_time();
            finished = finished.max(req.completion_time().unwrap_or(finished));
        }

        let metrics = PatronMetrics {
            id: self.id,
            arrival: self.arrival,
            turnaround: finished - start,
            response: response.unwrap_or(0),
            waiting,
        };
        info!("patron {} got order in {}", self.id, metrics.turnaround);
        Ok(metrics)
    }
}

/// Shared sink for patron metrics, one line per patron.
pub struct Report<W: Write> {
    sink: Mutex<W>,
}

impl<W: Write> Report<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn record(&self, metrics: &PatronMetrics) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(sink, "{}", metrics)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
