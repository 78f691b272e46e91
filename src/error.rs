//! Crate-wide error type.
//!
//! Grouped by subsystem, mirroring the rest of this codebase's error
//! modules: submission failures are the only ones a caller is expected to
//! handle; invariant violations are bugs and pair with an abort path.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    // -- submission errors --
    /// A task was posted to a queue that has already been shut down or
    /// whose owning `SequenceManager` has been destroyed.
    #[error("queue `{queue}` has been shut down; task rejected")]
    QueueShutDown { queue: String },

    // -- queue lifecycle errors --
    /// A queue operation referenced a queue that is no longer registered.
    #[error("queue `{queue}` is not registered with this sequence manager")]
    QueueNotRegistered { queue: String },

    // -- time domain errors --
    /// A `TaskQueue` referenced a `TimeDomain` that was never registered,
    /// or was unregistered while still in use.
    #[error("time domain `{0}` is not registered")]
    TimeDomainNotRegistered(String),

    // -- internal invariant violations --
    /// A heap, lock-order, or sentinel assertion failed. These are bugs,
    /// not recoverable states; production code pairs this variant with
    /// `std::process::abort()` after logging it.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}
