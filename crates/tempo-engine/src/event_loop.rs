//! The event loop: phase ordering, microtask drain, parking, termination
//!
//! One logical thread drives every phase and every callback. The only
//! synchronization in the system sits at the pool mailbox; everything here
//! is single-threaded by construction.
//!
//! A tick runs its phases in a fixed order: timer, immediate, IO
//! completion, then a trailing immediate pass so that immediates scheduled
//! while the IO phase ran execute before any timer that became ready
//! meanwhile. The microtask queue is drained to empty after every single
//! callback, transitively.

use crate::clock::{Clock, SystemClock};
use crate::error::ScheduleError;
use crate::pool::{WorkerJob, WorkerPool, DEFAULT_POOL_CAPACITY};
use crate::queue::TimerQueue;
use crate::task::{Callback, CallbackResult, Task, TaskId, TaskKind};
use crate::trace::{NopSink, Phase, TraceEvent, TraceSink};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of the loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, not yet driven (or returned from `run_until_idle`)
    Idle,
    /// Inside `run` or `run_until_idle`
    Running,
    /// Reached quiescence; never restarts
    Terminated,
}

/// Handle for a pending external event.
///
/// Satisfying the source enqueues its registered callback as an
/// IOCompletion task. Pool jobs resolve their source automatically when
/// they finish.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompletionSource {
    id: TaskId,
}

impl CompletionSource {
    /// The id used to cancel the pending callback.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

/// A deterministic, phase-ordered event loop with a bounded worker pool.
///
/// An explicit owned object with an explicit `run` entry point: there is no
/// ambient global loop, so independent loops (one per test, say) cannot
/// interfere with each other.
pub struct EventLoop {
    clock: Arc<dyn Clock>,
    sink: Rc<dyn TraceSink>,

    timers: TimerQueue,
    immediates: VecDeque<Task>,
    io: VecDeque<Task>,
    microtasks: VecDeque<Task>,

    pool: WorkerPool,
    /// Callbacks waiting on an external event, keyed by source id
    pending_sources: FxHashMap<TaskId, Callback>,

    /// Ids currently queued or pending, for idempotent cancellation
    live: FxHashSet<TaskId>,
    /// Cancelled ids not yet swept out of their queue
    cancelled: FxHashSet<TaskId>,

    next_id: u64,
    next_seq: u64,
    ticks: u64,
    state: LoopState,
}

impl EventLoop {
    /// Create a loop over real time with the default pool capacity.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a loop over an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sink: Rc::new(NopSink),
            timers: TimerQueue::new(),
            immediates: VecDeque::new(),
            io: VecDeque::new(),
            microtasks: VecDeque::new(),
            pool: WorkerPool::new(DEFAULT_POOL_CAPACITY),
            pending_sources: FxHashMap::default(),
            live: FxHashSet::default(),
            cancelled: FxHashSet::default(),
            next_id: 1,
            next_seq: 0,
            ticks: 0,
            state: LoopState::Idle,
        }
    }

    /// Replace the trace sink; takes effect for subsequent events.
    pub fn set_trace_sink(&mut self, sink: Rc<dyn TraceSink>) {
        self.sink = sink;
    }

    /// Set the worker pool capacity.
    ///
    /// Must happen before the first blocking submission: the capacity is
    /// locked once worker threads exist.
    pub fn set_pool_capacity(&mut self, capacity: usize) -> Result<(), ScheduleError> {
        self.pool.set_capacity(capacity)
    }

    /// Configured worker pool capacity.
    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The clock this loop schedules against.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ========================================================================
    // Scheduling API
    // ========================================================================

    /// Enqueue a timer callback to run once `delay` has elapsed.
    ///
    /// A zero delay still defers to at least the next tick's timer phase;
    /// callbacks never run inline from here.
    pub fn schedule_timer<F>(&mut self, delay: Duration, callback: F) -> TaskId
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        let ready_at = self.clock.now() + delay;
        let task = self.make_task(TaskKind::Timer, Some(ready_at), Box::new(callback));
        let id = task.id;
        self.timers.push(task);
        id
    }

    /// Enqueue a callback for the next immediate pass.
    ///
    /// Runs after every timer callback ready in the current tick and before
    /// the next tick's IO phase.
    pub fn schedule_immediate<F>(&mut self, callback: F) -> TaskId
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        let task = self.make_task(TaskKind::Immediate, None, Box::new(callback));
        let id = task.id;
        self.immediates.push_back(task);
        id
    }

    /// Enqueue a microtask.
    ///
    /// Runs before the next queued task of any other kind: at most one
    /// macro callback executes between submission and execution.
    pub fn defer_microtask<F>(&mut self, callback: F) -> TaskId
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        let task = self.make_task(TaskKind::Microtask, None, Box::new(callback));
        let id = task.id;
        self.microtasks.push_back(task);
        id
    }

    /// Register a pending external event.
    ///
    /// The callback runs as an IOCompletion task once the source is
    /// satisfied. A source that is never satisfied does not keep the loop
    /// alive; only timers and pool work do.
    pub fn completion_source<F>(&mut self, callback: F) -> CompletionSource
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        let id = self.alloc_id();
        self.pending_sources.insert(id, Box::new(callback));
        self.live.insert(id);
        CompletionSource { id }
    }

    /// Satisfy a pending source, moving its callback into the IOCompletion
    /// queue. Satisfying an unknown, cancelled, or already-satisfied source
    /// is a no-op.
    pub fn satisfy(&mut self, source: CompletionSource) {
        let Some(callback) = self.pending_sources.remove(&source.id) else {
            return;
        };
        let seq = self.alloc_seq();
        self.io.push_back(Task {
            id: source.id,
            kind: TaskKind::IoCompletion,
            seq,
            ready_at: None,
            callback,
        });
    }

    /// Offload a CPU-bound unit of work, modeled by its `cost`, to the
    /// worker pool.
    ///
    /// The callback runs as an IOCompletion task once the job finishes.
    /// Never blocks the caller; fails once the pool has shut down.
    pub fn submit_blocking<F>(
        &mut self,
        cost: Duration,
        callback: F,
    ) -> Result<CompletionSource, ScheduleError>
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        let id = self.alloc_id();
        self.pool.submit(WorkerJob { source: id, cost })?;
        self.pending_sources.insert(id, Box::new(callback));
        self.live.insert(id);
        self.sink.record(&TraceEvent::JobSubmitted { id, cost });
        Ok(CompletionSource { id })
    }

    /// Synchronous blocking call made directly on the loop thread.
    ///
    /// Stalls every queue for `cost` and never touches the worker pool.
    /// This exists to reproduce the loop-starvation anti-pattern; use
    /// `submit_blocking` for anything that should not freeze the loop.
    pub fn submit_blocking_sync(&mut self, cost: Duration) -> Duration {
        self.clock.advance(cost);
        cost
    }

    /// Cancel a queued task or pending source before it runs.
    ///
    /// Unknown, already-run, and already-cancelled ids are no-ops. A pool
    /// job already on a worker thread runs to completion, but its result is
    /// dropped and the completion callback is skipped.
    pub fn cancel(&mut self, id: TaskId) {
        if !self.live.remove(&id) {
            return;
        }
        if self.pending_sources.remove(&id).is_some() {
            return;
        }
        self.cancelled.insert(id);
    }

    // ========================================================================
    // Driving the loop
    // ========================================================================

    /// Drive the loop until it is quiescent: all queues empty, no future
    /// timer, no outstanding pool work.
    ///
    /// Parks (without spinning) whenever only future work remains. On
    /// termination the pool is shut down; later submissions are rejected.
    pub fn run(&mut self) {
        if self.state == LoopState::Terminated {
            return;
        }
        self.state = LoopState::Running;

        loop {
            self.tick();
            if self.has_ready_work() {
                continue;
            }
            if self.has_pending_work() {
                self.sink.record(&TraceEvent::Parked);
                self.park();
                continue;
            }
            break;
        }

        self.state = LoopState::Terminated;
        self.sink.record(&TraceEvent::Terminated);
        tracing::debug!(ticks = self.ticks, "event loop terminated");
        self.pool.shutdown();
    }

    /// Drive the loop until nothing is immediately ready, without parking.
    ///
    /// Future timers and outstanding pool work stay queued; the loop
    /// returns to `Idle` and may be driven again.
    pub fn run_until_idle(&mut self) {
        if self.state == LoopState::Terminated {
            return;
        }
        self.state = LoopState::Running;

        loop {
            self.tick();
            if !self.has_ready_work() {
                break;
            }
        }

        self.state = LoopState::Idle;
    }

    // ========================================================================
    // Tick phases
    // ========================================================================

    fn tick(&mut self) {
        self.ticks += 1;
        self.sink.record(&TraceEvent::TickStart { tick: self.ticks });

        self.drain_completions();
        // microtasks deferred from top-level code run before any phase
        self.drain_microtasks();

        self.timer_phase();
        self.immediate_pass();
        self.io_phase();
        // trailing pass: immediates scheduled while the IO phase ran execute
        // before this tick ends, ahead of any timer that became ready
        self.immediate_pass();

        // keep cancelled deadlines from holding the loop parked
        self.timers.purge_cancelled(&mut self.cancelled);
    }

    /// Run every timer that was ready and enqueued before this pass began.
    ///
    /// The seq snapshot keeps a zero-delay timer scheduled from inside the
    /// phase out of the current pass; it waits for the next tick.
    fn timer_phase(&mut self) {
        self.sink.record(&TraceEvent::PhaseEnter {
            tick: self.ticks,
            phase: Phase::Timer,
        });

        let phase_now = self.clock.now();
        let seq_limit = self.next_seq;
        while let Some(task) = self.timers.pop_ready(phase_now, seq_limit) {
            if self.consume_cancelled(task.id) {
                continue;
            }
            self.invoke(task);
        }
    }

    /// Run the immediates queued at pass entry, in enqueue order.
    ///
    /// Length snapshot: immediates scheduled by this pass's own callbacks
    /// stay queued for a later pass.
    fn immediate_pass(&mut self) {
        self.sink.record(&TraceEvent::PhaseEnter {
            tick: self.ticks,
            phase: Phase::Immediate,
        });

        let batch = self.immediates.len();
        for _ in 0..batch {
            let Some(task) = self.immediates.pop_front() else {
                break;
            };
            if self.consume_cancelled(task.id) {
                continue;
            }
            self.invoke(task);
        }
    }

    /// Run the IO completions queued at phase entry, in enqueue order.
    fn io_phase(&mut self) {
        self.drain_completions();
        self.sink.record(&TraceEvent::PhaseEnter {
            tick: self.ticks,
            phase: Phase::IoCompletion,
        });

        let batch = self.io.len();
        for _ in 0..batch {
            let Some(task) = self.io.pop_front() else {
                break;
            };
            if self.consume_cancelled(task.id) {
                continue;
            }
            self.invoke(task);
        }
    }

    /// Move finished pool jobs out of the mailbox into the IOCompletion
    /// queue, in real finish order.
    fn drain_completions(&mut self) {
        let completions = self.pool.mailbox().drain();
        if completions.is_empty() {
            return;
        }
        self.pool.acknowledge(completions.len());

        for completion in completions {
            self.sink.record(&TraceEvent::JobCompleted {
                id: completion.source,
                elapsed: completion.elapsed,
            });
            let Some(callback) = self.pending_sources.remove(&completion.source) else {
                // cancelled while in flight; drop the result
                continue;
            };
            let seq = self.alloc_seq();
            self.io.push_back(Task {
                id: completion.source,
                kind: TaskKind::IoCompletion,
                seq,
                ready_at: None,
                callback,
            });
        }
    }

    /// Drain the microtask queue to empty, including microtasks enqueued
    /// during the drain itself.
    fn drain_microtasks(&mut self) {
        while let Some(task) = self.microtasks.pop_front() {
            if self.consume_cancelled(task.id) {
                continue;
            }
            self.run_callback(task);
        }
    }

    /// Run one macro callback, then drain microtasks.
    fn invoke(&mut self, task: Task) {
        self.run_callback(task);
        self.drain_microtasks();
    }

    fn run_callback(&mut self, task: Task) {
        self.live.remove(&task.id);
        self.sink.record(&TraceEvent::Callback {
            id: task.id,
            kind: task.kind,
        });

        let mut cx = Context { event_loop: self };
        if let Err(error) = (task.callback)(&mut cx) {
            self.sink.record(&TraceEvent::CallbackFailed {
                id: task.id,
                kind: task.kind,
                error: &error,
            });
            tracing::warn!(id = task.id.as_u64(), %error, "callback failed; continuing");
        }
    }

    // ========================================================================
    // Parking and bookkeeping
    // ========================================================================

    fn has_ready_work(&self) -> bool {
        !self.microtasks.is_empty()
            || !self.immediates.is_empty()
            || !self.io.is_empty()
            || self.timers.has_ready(self.clock.now())
            || self.pool.mailbox().has_pending()
    }

    fn has_pending_work(&self) -> bool {
        self.pool.outstanding() > 0 || !self.timers.is_empty()
    }

    /// Block without spinning until the earliest of the next timer deadline
    /// or the next pool completion.
    fn park(&mut self) {
        let deadline = self.timers.next_deadline();
        if self.pool.outstanding() > 0 {
            match deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(self.clock.now());
                    self.pool.mailbox().wait_for(timeout);
                }
                None => self.pool.mailbox().wait(),
            }
        } else if let Some(deadline) = deadline {
            self.clock.advance_to(deadline);
        }
    }

    fn make_task(&mut self, kind: TaskKind, ready_at: Option<Instant>, callback: Callback) -> Task {
        let id = self.alloc_id();
        let seq = self.alloc_seq();
        self.live.insert(id);
        Task {
            id,
            kind,
            seq,
            ready_at,
            callback,
        }
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// True for ids whose cancellation has not been swept yet; consumes the
    /// tombstone.
    fn consume_cancelled(&mut self, id: TaskId) -> bool {
        self.cancelled.remove(&id)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling capability handed to every callback.
///
/// Exposes the same entry points as the loop itself, minus `run`: work
/// registered here is queued, never executed inline.
pub struct Context<'a> {
    event_loop: &'a mut EventLoop,
}

impl Context<'_> {
    /// Current instant on the loop's clock.
    pub fn now(&self) -> Instant {
        self.event_loop.clock.now()
    }

    /// See [`EventLoop::schedule_timer`].
    pub fn schedule_timer<F>(&mut self, delay: Duration, callback: F) -> TaskId
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        self.event_loop.schedule_timer(delay, callback)
    }

    /// See [`EventLoop::schedule_immediate`].
    pub fn schedule_immediate<F>(&mut self, callback: F) -> TaskId
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        self.event_loop.schedule_immediate(callback)
    }

    /// See [`EventLoop::defer_microtask`].
    pub fn defer_microtask<F>(&mut self, callback: F) -> TaskId
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        self.event_loop.defer_microtask(callback)
    }

    /// See [`EventLoop::completion_source`].
    pub fn completion_source<F>(&mut self, callback: F) -> CompletionSource
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        self.event_loop.completion_source(callback)
    }

    /// See [`EventLoop::satisfy`].
    pub fn satisfy(&mut self, source: CompletionSource) {
        self.event_loop.satisfy(source);
    }

    /// See [`EventLoop::submit_blocking`].
    pub fn submit_blocking<F>(
        &mut self,
        cost: Duration,
        callback: F,
    ) -> Result<CompletionSource, ScheduleError>
    where
        F: FnOnce(&mut Context<'_>) -> CallbackResult + 'static,
    {
        self.event_loop.submit_blocking(cost, callback)
    }

    /// See [`EventLoop::submit_blocking_sync`].
    pub fn submit_blocking_sync(&mut self, cost: Duration) -> Duration {
        self.event_loop.submit_blocking_sync(cost)
    }

    /// See [`EventLoop::cancel`].
    pub fn cancel(&mut self, id: TaskId) {
        self.event_loop.cancel(id);
    }
}
