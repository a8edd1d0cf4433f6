#![doc = include_str!("../README.md")]

mod clock;
mod drink;
mod error;
mod patron;
mod request;
mod scheduler;
mod server;
mod stats;

pub use clock::{Clock, Interrupted, SimClock, WallClock};
pub use drink::Drink;
pub use error::{ConfigError, RunError, SubmitError};
pub use patron::{Patron, PatronMetrics, Report};
pub use request::{Completed, Request};
pub use scheduler::{
    Discipline, Dispatch, Entry, Fcfs, Progress, RequestKey, RoundRobin, Scheduler, Sjf,
    DEFAULT_QUANTUM,
};
pub use server::{Server, ServerBuilder, Worker};
pub use stats::{Log2Histogram, ServerStats};
