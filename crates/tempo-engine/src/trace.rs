//! Observability collaborator
//!
//! Every callback invocation and phase transition is reported to an
//! injectable `TraceSink`. `NopSink` discards, `RecordingSink` keeps the
//! compact event strings for assertions, `TracingSink` forwards onto the
//! `tracing` facade.

use crate::error::CallbackError;
use crate::task::{TaskId, TaskKind};
use std::cell::RefCell;
use std::fmt;
use std::time::Duration;

/// Sub-stage of a tick dedicated to one task class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Timer,
    Immediate,
    IoCompletion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Timer => write!(f, "timer"),
            Phase::Immediate => write!(f, "immediate"),
            Phase::IoCompletion => write!(f, "io"),
        }
    }
}

/// A loop-lifecycle or callback event.
#[derive(Debug)]
pub enum TraceEvent<'a> {
    /// A new tick began
    TickStart { tick: u64 },
    /// The tick entered a phase
    PhaseEnter { tick: u64, phase: Phase },
    /// A callback is about to run
    Callback { id: TaskId, kind: TaskKind },
    /// A callback failed; the loop continues with the next task
    CallbackFailed {
        id: TaskId,
        kind: TaskKind,
        error: &'a CallbackError,
    },
    /// A blocking job was handed to the pool
    JobSubmitted { id: TaskId, cost: Duration },
    /// A pool job finished and its completion was queued
    JobCompleted { id: TaskId, elapsed: Duration },
    /// The loop parked waiting for a timer deadline or a pool completion
    Parked,
    /// The loop reached quiescence
    Terminated,
}

impl fmt::Display for TraceEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::TickStart { tick } => write!(f, "tick:{}", tick),
            TraceEvent::PhaseEnter { phase, .. } => write!(f, "phase:{}", phase),
            TraceEvent::Callback { id, kind } => write!(f, "run:{}#{}", kind, id.as_u64()),
            TraceEvent::CallbackFailed { id, kind, error } => {
                write!(f, "fail:{}#{}:{}", kind, id.as_u64(), error.message())
            }
            TraceEvent::JobSubmitted { id, .. } => write!(f, "job:{}", id.as_u64()),
            TraceEvent::JobCompleted { id, .. } => write!(f, "done:{}", id.as_u64()),
            TraceEvent::Parked => write!(f, "parked"),
            TraceEvent::Terminated => write!(f, "terminated"),
        }
    }
}

/// Injectable sink for loop events.
pub trait TraceSink {
    fn record(&self, event: &TraceEvent<'_>);
}

/// Discards every event.
#[derive(Default)]
pub struct NopSink;

impl TraceSink for NopSink {
    fn record(&self, _event: &TraceEvent<'_>) {}
}

/// Records the compact `Display` form of every event, in order.
///
/// Single-threaded by design, like the loop that feeds it.
#[derive(Default)]
pub struct RecordingSink {
    events: RefCell<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the recorded events, leaving the sink empty.
    pub fn take(&self) -> Vec<String> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

impl TraceSink for RecordingSink {
    fn record(&self, event: &TraceEvent<'_>) {
        self.events.borrow_mut().push(event.to_string());
    }
}

/// Forwards events onto the `tracing` facade.
#[derive(Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&self, event: &TraceEvent<'_>) {
        match event {
            TraceEvent::CallbackFailed { id, kind, error } => {
                tracing::warn!(id = id.as_u64(), kind = %kind, error = %error, "callback failed");
            }
            TraceEvent::Parked | TraceEvent::Terminated => {
                tracing::debug!(event = %event, "loop state");
            }
            _ => {
                tracing::trace!(event = %event, "loop event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display_forms() {
        let id = TaskId::new(7);
        assert_eq!(TraceEvent::TickStart { tick: 3 }.to_string(), "tick:3");
        assert_eq!(
            TraceEvent::PhaseEnter { tick: 1, phase: Phase::Timer }.to_string(),
            "phase:timer"
        );
        assert_eq!(
            TraceEvent::Callback { id, kind: TaskKind::Immediate }.to_string(),
            "run:immediate#7"
        );
        let error = CallbackError::new("boom");
        assert_eq!(
            TraceEvent::CallbackFailed { id, kind: TaskKind::Timer, error: &error }.to_string(),
            "fail:timer#7:boom"
        );
        assert_eq!(TraceEvent::Parked.to_string(), "parked");
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.record(&TraceEvent::TickStart { tick: 1 });
        sink.record(&TraceEvent::Parked);
        sink.record(&TraceEvent::Terminated);

        assert_eq!(sink.events(), vec!["tick:1", "parked", "terminated"]);
        assert_eq!(sink.take(), vec!["tick:1", "parked", "terminated"]);
        assert!(sink.take().is_empty());
    }
}
