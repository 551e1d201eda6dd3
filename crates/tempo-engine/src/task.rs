//! Task identity and the unit of queued work

use crate::error::CallbackError;
use crate::event_loop::Context;
use std::fmt;
use std::time::Instant;

/// Unique identifier for a scheduled task or pending completion source.
///
/// Ids are allocated by the owning loop; two independent loops may hand out
/// overlapping ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(raw: u64) -> Self {
        TaskId(raw)
    }

    /// Get the numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Queue class a task belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Time-ordered, eligible once `ready_at` has passed
    Timer,
    /// FIFO, runs in a tick's immediate passes
    Immediate,
    /// FIFO, carries a satisfied external event back into the loop
    IoCompletion,
    /// FIFO, drained to empty after every other callback
    Microtask,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Timer => write!(f, "timer"),
            TaskKind::Immediate => write!(f, "immediate"),
            TaskKind::IoCompletion => write!(f, "io"),
            TaskKind::Microtask => write!(f, "microtask"),
        }
    }
}

/// Outcome of a task callback.
pub type CallbackResult = Result<(), CallbackError>;

/// A polymorphic zero-argument unit of work.
///
/// Arguments are closed over; the `Context` parameter is the scheduling
/// capability, letting a callback register follow-up work on the loop that
/// is running it. Callbacks are deliberately not `Send` — they never leave
/// the loop thread.
pub type Callback = Box<dyn FnOnce(&mut Context<'_>) -> CallbackResult>;

/// A queued unit of work.
pub(crate) struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Queue class
    pub kind: TaskKind,

    /// Loop-global enqueue order; the FIFO tie-break everywhere
    pub seq: u64,

    /// Eligibility deadline (timers only)
    pub ready_at: Option<Instant>,

    /// The work itself
    pub callback: Callback,
}
