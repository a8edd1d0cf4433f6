use thiserror::Error;

/// Raised synchronously while building a server. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported scheduling discipline selector: {0} (expected 0 = FCFS, 1 = SJF, 2 = RR)")]
    UnsupportedDiscipline(u8),
    #[error("round robin quantum must be > 0")]
    ZeroQuantum,
    #[error("submission capacity must be > 0 when bounded")]
    ZeroCapacity,
    #[error("wall clock time unit must be > 0")]
    ZeroTimeUnit,
}

/// Returned from `Server::submit`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("request was already submitted")]
    AlreadySubmitted,
    #[error("server has shut down")]
    ShutDown,
}

/// Returned from `Server::run`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("dispatch loop is already running")]
    AlreadyRunning,
}
