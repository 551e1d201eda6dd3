//! Error types for the scheduling surface
//!
//! Only configuration and pool-lifecycle problems surface to API callers.
//! Callback failures are contained at the loop boundary and reported through
//! the trace sink; they never stop subsequent tasks.

use thiserror::Error;

/// Errors returned synchronously by the scheduling API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Worker pool capacity must be at least one slot
    #[error("invalid worker pool capacity {0}: need at least 1 slot")]
    InvalidCapacity(usize),

    /// Capacity can only change before the first blocking submission
    #[error("worker pool capacity is locked once the pool has started")]
    CapacityLocked,

    /// Submission arrived after pool shutdown
    #[error("rejected: shutting down")]
    PoolRejected,
}

/// Failure raised by a task callback during execution.
///
/// The loop catches these at the callback boundary, reports them, and moves
/// on to the next task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(String);

impl CallbackError {
    /// Wrap a failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self(message)
    }
}
