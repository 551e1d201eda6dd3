//! Bounded worker pool for CPU-bound units of work
//!
//! Workers never touch the loop's queues. A job crosses to a worker thread
//! as `{source, cost}`, runs to completion there, and crosses back as a
//! `Completion` through the mailbox — the only shared-mutable-state boundary
//! in the system.

use crate::error::ScheduleError;
use crate::task::TaskId;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default number of worker slots.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// A CPU-bound unit of work, modeled by its cost.
#[derive(Debug)]
pub(crate) struct WorkerJob {
    /// Completion source this job resolves
    pub source: TaskId,
    /// Modeled execution cost
    pub cost: Duration,
}

/// Result of a finished job, posted back by a worker thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub source: TaskId,
    /// Measured wall time the job occupied its slot
    pub elapsed: Duration,
}

/// Lock-protected completion hand-off between workers and the loop.
///
/// Workers post in real finish order; the loop drains in that same order,
/// either between ticks or while parked on the condvar.
pub(crate) struct Mailbox {
    inbox: Mutex<VecDeque<Completion>>,
    notify: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            notify: Condvar::new(),
        }
    }

    /// Post a completion and wake a parked loop.
    fn post(&self, completion: Completion) {
        self.inbox.lock().push_back(completion);
        self.notify.notify_one();
    }

    /// Take every completion posted so far, in finish order.
    pub fn drain(&self) -> Vec<Completion> {
        self.inbox.lock().drain(..).collect()
    }

    /// True if at least one completion is waiting.
    pub fn has_pending(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    /// Block until at least one completion is available.
    pub fn wait(&self) {
        let mut inbox = self.inbox.lock();
        while inbox.is_empty() {
            self.notify.wait(&mut inbox);
        }
    }

    /// Block until a completion arrives or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) {
        let mut inbox = self.inbox.lock();
        if inbox.is_empty() {
            self.notify.wait_for(&mut inbox, timeout);
        }
    }
}

/// Fixed set of worker slots fed by a FIFO job channel.
///
/// Threads spawn lazily on the first submission and the capacity is locked
/// from that point on. With `capacity >= k`, `k` equal-cost jobs finish in
/// one wave; with capacity 1 they serialize, one cost apart. Shutdown drops
/// the job sender so workers drain what is queued and exit, then joins each
/// thread with a bounded timeout.
pub(crate) struct WorkerPool {
    capacity: usize,
    job_tx: Option<Sender<WorkerJob>>,
    mailbox: Arc<Mailbox>,
    handles: Vec<JoinHandle<()>>,
    outstanding: usize,
    shutting_down: bool,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 1);
        Self {
            capacity,
            job_tx: None,
            mailbox: Arc::new(Mailbox::new()),
            handles: Vec::new(),
            outstanding: 0,
            shutting_down: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once worker threads exist; capacity is locked from here on.
    pub fn started(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), ScheduleError> {
        if capacity == 0 {
            return Err(ScheduleError::InvalidCapacity(capacity));
        }
        if self.started() {
            return Err(ScheduleError::CapacityLocked);
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Jobs submitted whose completions have not been drained yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Hand a job to the pool; queued FIFO when all slots are busy.
    pub fn submit(&mut self, job: WorkerJob) -> Result<(), ScheduleError> {
        if self.shutting_down {
            return Err(ScheduleError::PoolRejected);
        }
        if !self.started() {
            self.start();
        }
        match &self.job_tx {
            Some(tx) => {
                tx.send(job).map_err(|_| ScheduleError::PoolRejected)?;
                self.outstanding += 1;
                Ok(())
            }
            None => Err(ScheduleError::PoolRejected),
        }
    }

    /// Account for completions taken out of the mailbox.
    pub fn acknowledge(&mut self, count: usize) {
        self.outstanding = self.outstanding.saturating_sub(count);
    }

    fn start(&mut self) {
        let (job_tx, job_rx) = channel::unbounded::<WorkerJob>();
        for id in 0..self.capacity {
            let rx = job_rx.clone();
            let mailbox = Arc::clone(&self.mailbox);
            let handle = thread::Builder::new()
                .name(format!("tempo-pool-{}", id))
                .spawn(move || {
                    // recv fails once the sender is dropped at shutdown
                    while let Ok(job) = rx.recv() {
                        let started = Instant::now();
                        thread::sleep(job.cost);
                        mailbox.post(Completion {
                            source: job.source,
                            elapsed: started.elapsed(),
                        });
                    }
                })
                .expect("failed to spawn pool worker thread");
            self.handles.push(handle);
        }
        self.job_tx = Some(job_tx);
        tracing::debug!(capacity = self.capacity, "worker pool started");
    }

    /// Stop accepting jobs, let running jobs finish, join the workers.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.job_tx.take();

        let timeout = Duration::from_secs(2);
        for handle in self.handles.drain(..) {
            Self::join_with_timeout(handle, timeout);
        }
    }

    /// Join a worker with timeout, detach if stuck.
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
