//! tempo-engine: a deterministic, phase-ordered event loop with a bounded
//! worker pool for blocking work.
//!
//! Top-level code runs synchronously to completion; the scheduling entry
//! points (`schedule_timer`, `schedule_immediate`, `defer_microtask`,
//! `submit_blocking`) only register work. [`EventLoop::run`] then executes
//! one full tick at a time — timer phase, immediate pass, IO-completion
//! phase, trailing immediate pass — draining the microtask queue after
//! every single callback, parking when only future work remains, and
//! terminating at quiescence.
//!
//! CPU-bound work is offloaded to a fixed set of pool threads and comes
//! back into the loop as an IOCompletion task, in real finish order. The
//! pool mailbox is the only synchronized hand-off in the system; callbacks
//! and phases are single-threaded by construction.

mod clock;
mod error;
mod event_loop;
mod pool;
mod queue;
mod task;
mod trace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CallbackError, ScheduleError};
pub use event_loop::{CompletionSource, Context, EventLoop, LoopState};
pub use pool::DEFAULT_POOL_CAPACITY;
pub use task::{Callback, CallbackResult, TaskId, TaskKind};
pub use trace::{NopSink, Phase, RecordingSink, TraceEvent, TraceSink, TracingSink};
