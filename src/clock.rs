use crate::error::ConfigError;
use flume::{Receiver, RecvTimeoutError};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Elapsing service time was cut short because the server shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Source of time for the server and its producers, in abstract units.
///
/// All timestamps on a `Request` come from the clock of the server it was
/// submitted to, so they are comparable with each other and with `now()`.
pub trait Clock: Send + Sync + Debug {
    /// Current time in units.
    fn now(&self) -> u64;

    /// Spend `units` of service time on the worker thread.
    ///
    /// `interrupt` never carries a message; it disconnects when the server
    /// shuts down, at which point this returns `Err(Interrupted)`.
    fn elapse(&self, units: u64, interrupt: &Receiver<()>) -> Result<(), Interrupted>;

    /// Real time that `units` take to pass on their own.
    fn span(&self, units: u64) -> Duration;

    /// Move an idle clock forward to `at`. Clocks that advance by themselves
    /// ignore this.
    fn advance_to(&self, at: u64);
}

/// Virtual clock. Time moves only when the worker elapses service or skips
/// an idle stretch up to the next held arrival, so a run is deterministic
/// once every submission is in before the worker starts.
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }
}

impl Clock for SimClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn elapse(&self, units: u64, interrupt: &Receiver<()>) -> Result<(), Interrupted> {
        if interrupt.is_disconnected() {
            return Err(Interrupted);
        }
        self.now.fetch_add(units, Ordering::AcqRel);
        Ok(())
    }

    fn span(&self, _units: u64) -> Duration {
        Duration::ZERO
    }

    fn advance_to(&self, at: u64) {
        self.now.fetch_max(at, Ordering::AcqRel);
    }
}

/// Real-time clock where one unit lasts `unit`. Service sleeps, but wakes
/// early on shutdown.
#[derive(Debug)]
pub struct WallClock {
    origin: Instant,
    unit: Duration,
}

impl WallClock {
    pub fn new(unit: Duration) -> Result<Self, ConfigError> {
        if unit.is_zero() {
            return Err(ConfigError::ZeroTimeUnit);
        }
        Ok(Self {
            origin: Instant::now(),
            unit,
        })
    }

    /// One unit per millisecond.
    pub fn millis() -> Self {
        Self {
            origin: Instant::now(),
            unit: Duration::from_millis(1),
        }
    }
}

impl Clock for WallClock {
    fn now(&self) -> u64 {
        let units = self.origin.elapsed().as_nanos() / self.unit.as_nanos();
        u64::try_from(units).unwrap_or(u64::MAX)
    }

    fn elapse(&self, units: u64, interrupt: &Receiver<()>) -> Result<(), Interrupted> {
        match interrupt.recv_timeout(self.span(units)) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(Interrupted),
        }
    }

    fn span(&self, units: u64) -> Duration {
        let nanos = u64::try_from(self.unit.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(nanos.saturating_mul(units))
    }

    fn advance_to(&self, _at: u64) {}
}
