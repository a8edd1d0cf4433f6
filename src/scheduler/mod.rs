mod fcfs;
mod round_robin;
mod sjf;
pub use fcfs::Fcfs;
pub use round_robin::RoundRobin;
pub use sjf::Sjf;

use crate::error::ConfigError;
use std::fmt;
use std::num::NonZeroU64;

/// Key of an in-flight request in the server's table.
pub type RequestKey = usize;

/// Quantum used when none is configured.
pub const DEFAULT_QUANTUM: u64 = 25;

/// What a discipline needs to know about a pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: RequestKey,
    /// Submission order; strictly increasing across the server.
    pub seq: u64,
    pub service: u64,
}

/// The next request to service and for how long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub key: RequestKey,
    pub slice: u64,
}

/// Outcome of servicing a slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Done,
    Remaining(u64),
}

/// Queue discipline: chooses *which request* the server services next.
///
/// Owned by the worker thread only, so implementations need no locking.
pub trait Scheduler: Send {
    /// Add a pending request. A request handed back after `Progress::Remaining`
    /// goes to the tail of the current round.
    fn push(&mut self, entry: Entry);
    fn pop(&mut self) -> Option<Dispatch>;
    /// Account `served` units to a request popped earlier.
    fn observe(&mut self, key: RequestKey, served: u64) -> Progress;
    fn clear_state(&mut self, key: RequestKey);
    fn is_runnable(&self) -> bool;
    fn len(&self) -> usize;
}

/// Selects the queue discipline used by a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// First come, first served.
    Fcfs,
    /// Shortest job first, non-preemptive.
    Sjf,
    /// Round robin with a fixed quantum.
    RoundRobin { quantum: NonZeroU64 },
}

impl Discipline {
    /// Decode a numeric selector: 0 = FCFS, 1 = SJF, 2 = RR. `quantum` is
    /// only checked for RR.
    pub fn from_selector(selector: u8, quantum: u64) -> Result<Self, ConfigError> {
        match selector {
            0 => Ok(Discipline::Fcfs),
            1 => Ok(Discipline::Sjf),
            2 => Discipline::round_robin(quantum),
            other => Err(ConfigError::UnsupportedDiscipline(other)),
        }
    }

    pub fn round_robin(quantum: u64) -> Result<Self, ConfigError> {
        let quantum = NonZeroU64::new(quantum).ok_or(ConfigError::ZeroQuantum)?;
        Ok(Discipline::RoundRobin { quantum })
    }

    pub fn selector(self) -> u8 {
        match self {
            Discipline::Fcfs => 0,
            Discipline::Sjf => 1,
            Discipline::RoundRobin { .. } => 2,
        }
    }

    pub fn scheduler(self) -> Box<dyn Scheduler> {
        match self {
            Discipline::Fcfs => Box::new(Fcfs::new()),
            Discipline::Sjf => Box::new(Sjf::new()),
            Discipline::RoundRobin { quantum } => Box::new(RoundRobin::new(quantum)),
        }
    }
}

impl Default for Discipline {
    fn default() -> Self {
        Discipline::Fcfs
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discipline::Fcfs => f.write_str("FCFS"),
            Discipline::Sjf => f.write_str("SJF"),
            Discipline::RoundRobin { quantum } => write!(f, "RR(q={})", quantum),
        }
    }
}
