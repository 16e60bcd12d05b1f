//! Execution strategies.
//!
//! Every strategy accepts zero-argument work through `Scheduler::submit` and
//! runs it at most once. Which one a server uses is picked from a signed
//! thread budget:
//!
//! - `0`: [`Direct`], run on the submitting thread under an admission lock.
//! - `< 0`: [`Threaded`] without a limit, one thread per submission.
//! - `> 0`: bounded [`Threaded`], a fixed [`Iterative`] pool, or
//!   [`Pipelining`] on top of that pool.
//!
//! Pipelining never runs a handler to completion in one slot. Each queue
//! entry performs exactly one step and, if the handler wants to continue,
//! pushes a fresh entry for the next step. A pool of N workers therefore
//! interleaves steps from any number of connections while never executing
//! more than N steps at once.

use crate::runtime::handler::{run_to_completion, EventHandler, Step};
use crate::runtime::task::{
    new_slot, settle, Outcome, ResultSlot, Settle, TaskEnvelope, TaskHandle, Work,
};
use crate::sync::{AliveFlag, Synchronized};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How long a blocked admission or queue pop waits before re-checking the
/// alive flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Common contract of all execution strategies.
pub trait Scheduler: Send + Sync {
    /// Arrange eventual, at-most-once execution of `work`.
    fn submit(&self, work: Work) -> TaskHandle;

    /// Number of tasks currently executing.
    fn active(&self) -> usize;

    /// Stop accepting work and wait up to `drain` for running work to
    /// reach a checkpoint.
    fn shutdown(&self, drain: Duration);
}

/// Runs work immediately on the caller's thread, one submission at a time.
#[derive(Debug, Default)]
pub struct Direct {
    admission: Synchronized<u64>,
    active: Synchronized<usize>,
}

impl Direct {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for Direct {
    fn submit(&self, work: Work) -> TaskHandle {
        let (envelope, handle) = TaskEnvelope::new(work);

        self.admission.modify(|runs| {
            self.active.modify(|n| *n += 1);
            envelope.run();
            self.active.modify(|n| *n -= 1);
            *runs += 1;
        });

        handle
    }

    fn active(&self) -> usize {
        self.active.get()
    }

    fn shutdown(&self, _drain: Duration) {}
}

/// Spawns one thread per submission, optionally limited to `limit`
/// concurrently active threads.
#[derive(Debug)]
pub struct Threaded {
    limit: Option<usize>,
    active: Arc<Synchronized<usize>>,
    spawned: Synchronized<u64>,
    alive: AliveFlag,
}

impl Threaded {
    /// One thread per submission, never blocking the submitter.
    pub fn unbounded(alive: AliveFlag) -> Self {
        Self {
            limit: None,
            active: Arc::new(Synchronized::new(0)),
            spawned: Synchronized::new(0),
            alive,
        }
    }

    /// One thread per submission, blocking the submitter while `limit`
    /// threads are active.
    pub fn bounded(limit: usize, alive: AliveFlag) -> Self {
        Self {
            limit: Some(limit.max(1)),
            ..Self::unbounded(alive)
        }
    }

    /// Reserve an active slot. Returns `false` if the alive flag cleared
    /// while waiting.
    ///
    /// Admission is not FIFO: whichever blocked submitter wakes first after
    /// a slot frees takes it.
    fn admit(&self) -> bool {
        let Some(limit) = self.limit else {
            self.active.modify(|n| *n += 1);
            return true;
        };

        loop {
            if !self.alive.is_alive() {
                return false;
            }

            let admitted = self
                .active
                .wait_for(POLL_INTERVAL, |n| *n < limit, |n| *n += 1)
                .is_some();

            if admitted {
                if self.alive.is_alive() {
                    return true;
                }
                release(&self.active);
                return false;
            }
            trace!(limit, "Admission blocked, all threads busy");
        }
    }
}

fn release(active: &Synchronized<usize>) {
    active.modify(|n| *n = n.saturating_sub(1));
}

impl Scheduler for Threaded {
    fn submit(&self, work: Work) -> TaskHandle {
        let (envelope, handle) = TaskEnvelope::new(work);

        if !self.admit() {
            debug!("Submission refused, server is shutting down");
            return handle;
        }

        let id = self.spawned.modify(|n| {
            *n += 1;
            *n
        });
        let active = Arc::clone(&self.active);

        let spawned = thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                envelope.run();
                release(&active);
            });

        if let Err(e) = spawned {
            // The envelope went down with the closure and reports Cancelled.
            warn!(error = %e, "Failed to spawn task thread");
            release(&self.active);
        }

        handle
    }

    fn active(&self) -> usize {
        self.active.get()
    }

    fn shutdown(&self, drain: Duration) {
        self.alive.kill();
        if self.active.wait_for(drain, |n| *n == 0, |_| ()).is_none() {
            warn!(active = self.active.get(), "Task threads still running after drain timeout");
        }
    }
}

/// Queue and counters shared by the workers of an [`Iterative`] pool.
#[derive(Debug)]
struct Pool {
    queue: Synchronized<VecDeque<TaskEnvelope>>,
    busy: Synchronized<usize>,
    alive: AliveFlag,
}

impl Pool {
    fn push(&self, envelope: TaskEnvelope) {
        self.queue.modify(|queue| queue.push_back(envelope));
    }

    fn worker_loop(&self, worker_id: usize) {
        debug!(worker = worker_id, "Worker started");

        while self.alive.is_alive() {
            // Pop and busy count change together; nothing is popped once the
            // flag clears.
            let next = self
                .queue
                .wait_for(POLL_INTERVAL, |queue| !queue.is_empty(), |queue| {
                    if !self.alive.is_alive() {
                        return None;
                    }
                    let envelope = queue.pop_front()?;
                    self.busy.modify(|n| *n += 1);
                    Some(envelope)
                })
                .flatten();

            let Some(envelope) = next else {
                continue;
            };

            envelope.run();
            release(&self.busy);
        }

        debug!(worker = worker_id, "Worker stopped");
    }
}

enum IterativeMode {
    Pool {
        pool: Arc<Pool>,
        workers: Synchronized<Vec<JoinHandle<()>>>,
    },
    Fallback(Box<dyn Scheduler>),
}

/// A fixed pool of worker threads fed from one FIFO queue.
///
/// With a budget of zero or less there is no pool and submissions behave
/// as in [`Direct`] (zero) or unbounded [`Threaded`] (negative).
pub struct Iterative {
    mode: IterativeMode,
    alive: AliveFlag,
}

impl Iterative {
    /// Spawn `budget` workers. Fails only if a worker thread cannot be
    /// spawned.
    pub fn new(budget: i64, alive: AliveFlag) -> io::Result<Self> {
        let Ok(size) = usize::try_from(budget) else {
            let fallback = Box::new(Threaded::unbounded(alive.clone()));
            return Ok(Self {
                mode: IterativeMode::Fallback(fallback),
                alive,
            });
        };
        if size == 0 {
            return Ok(Self {
                mode: IterativeMode::Fallback(Box::new(Direct::new())),
                alive,
            });
        }

        let pool = Arc::new(Pool {
            queue: Synchronized::new(VecDeque::new()),
            busy: Synchronized::new(0),
            alive: alive.clone(),
        });

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let pool = Arc::clone(&pool);
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || pool.worker_loop(worker_id));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    alive.kill();
                    return Err(e);
                }
            }
        }

        info!(workers = size, "Worker pool started");

        Ok(Self {
            mode: IterativeMode::Pool {
                pool,
                workers: Synchronized::new(workers),
            },
            alive,
        })
    }

    /// Number of pool workers (zero for the fallback modes).
    pub fn size(&self) -> usize {
        match &self.mode {
            IterativeMode::Pool { workers, .. } => workers.read(Vec::len),
            IterativeMode::Fallback(_) => 0,
        }
    }

    /// Number of envelopes waiting in the queue.
    pub fn queued(&self) -> usize {
        match &self.mode {
            IterativeMode::Pool { pool, .. } => pool.queue.read(VecDeque::len),
            IterativeMode::Fallback(_) => 0,
        }
    }

    fn pool(&self) -> Option<&Arc<Pool>> {
        match &self.mode {
            IterativeMode::Pool { pool, .. } => Some(pool),
            IterativeMode::Fallback(_) => None,
        }
    }
}

impl Scheduler for Iterative {
    fn submit(&self, work: Work) -> TaskHandle {
        match &self.mode {
            IterativeMode::Pool { pool, .. } => {
                let (envelope, handle) = TaskEnvelope::new(work);
                if self.alive.is_alive() {
                    pool.push(envelope);
                }
                handle
            }
            IterativeMode::Fallback(fallback) => fallback.submit(work),
        }
    }

    fn active(&self) -> usize {
        match &self.mode {
            IterativeMode::Pool { pool, .. } => pool.busy.get(),
            IterativeMode::Fallback(fallback) => fallback.active(),
        }
    }

    fn shutdown(&self, drain: Duration) {
        self.alive.kill();

        match &self.mode {
            IterativeMode::Pool { pool, workers } => {
                // Wake idle workers so they notice the cleared flag now.
                pool.queue.modify(|_| ());

                let handles = workers.modify(std::mem::take);
                if pool.busy.wait_for(drain, |n| *n == 0, |_| ()).is_none() {
                    // Busy workers finish on their own; leave them detached.
                    warn!(
                        busy = pool.busy.get(),
                        "Workers still running after drain timeout"
                    );
                } else {
                    let current = thread::current().id();
                    for handle in handles {
                        if handle.thread().id() != current && handle.join().is_err() {
                            warn!("Worker thread panicked");
                        }
                    }
                }

                let pending = pool.queue.modify(std::mem::take);
                if !pending.is_empty() {
                    debug!(pending = pending.len(), "Cancelling queued tasks");
                }
            }
            IterativeMode::Fallback(fallback) => fallback.shutdown(drain),
        }
    }
}

/// Steps resumable handlers one increment per queue entry on an
/// [`Iterative`] pool.
pub struct Pipelining {
    pool: Iterative,
}

impl Pipelining {
    pub fn new(budget: i64, alive: AliveFlag) -> io::Result<Self> {
        Ok(Self {
            pool: Iterative::new(budget, alive)?,
        })
    }

    /// Queue the first step of `handler`.
    ///
    /// The handle settles once the handler reports `Done`, fails, panics, or
    /// is dropped at shutdown.
    pub fn submit(&self, handler: Box<dyn EventHandler>) -> TaskHandle {
        let Some(pool) = self.pool.pool() else {
            // No pool to requeue onto: drive the handler whole through the
            // fallback strategy.
            let alive = self.pool.alive.clone();
            let mut handler = handler;
            return self
                .pool
                .submit(Box::new(move || run_to_completion(handler.as_mut(), &alive)));
        };

        let slot = new_slot();
        let handle = TaskHandle::from_slot(Arc::clone(&slot));
        if pool.alive.is_alive() {
            pool.push(step_envelope(Arc::clone(pool), handler, slot));
        } else {
            settle(&slot, Outcome::Cancelled);
        }
        handle
    }

    pub fn active(&self) -> usize {
        self.pool.active()
    }

    pub fn shutdown(&self, drain: Duration) {
        self.pool.shutdown(drain);
    }
}

/// An envelope performing exactly one step of `handler`, requeueing itself
/// when the handler wants to continue.
fn step_envelope(
    pool: Arc<Pool>,
    mut handler: Box<dyn EventHandler>,
    slot: ResultSlot,
) -> TaskEnvelope {
    let continuation_slot = Arc::clone(&slot);

    TaskEnvelope::with_slot(
        Box::new(move || match handler.step()? {
            Step::Done => Ok(Settle::Done),
            Step::Continue if pool.alive.is_alive() => {
                let next = step_envelope(Arc::clone(&pool), handler, continuation_slot);
                pool.push(next);
                Ok(Settle::Deferred)
            }
            Step::Continue => {
                drop(handler);
                settle(&continuation_slot, Outcome::Cancelled);
                Ok(Settle::Deferred)
            }
        }),
        slot,
    )
}

/// Kind of strategy requested for a positive thread budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Threaded,
    Iterative,
    Pipelining,
}

/// The strategy a server dispatches handlers through.
pub enum Strategy {
    Direct(Direct),
    Threaded(Threaded),
    Iterative(Iterative),
    Pipelining(Pipelining),
}

impl Strategy {
    /// Pick a strategy from the signed thread budget.
    pub fn new(kind: StrategyKind, budget: i64, alive: AliveFlag) -> io::Result<Self> {
        let strategy = match budget {
            0 => Strategy::Direct(Direct::new()),
            b if b < 0 => Strategy::Threaded(Threaded::unbounded(alive)),
            b => match kind {
                StrategyKind::Threaded => {
                    let limit = usize::try_from(b).unwrap_or(usize::MAX);
                    Strategy::Threaded(Threaded::bounded(limit, alive))
                }
                StrategyKind::Iterative => Strategy::Iterative(Iterative::new(b, alive)?),
                StrategyKind::Pipelining => Strategy::Pipelining(Pipelining::new(b, alive)?),
            },
        };
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Direct(_) => "direct",
            Strategy::Threaded(_) => "threaded",
            Strategy::Iterative(_) => "iterative",
            Strategy::Pipelining(_) => "pipelining",
        }
    }

    /// Hand a handler to the strategy.
    pub fn dispatch(&self, handler: Box<dyn EventHandler>, alive: &AliveFlag) -> TaskHandle {
        let scheduler: &dyn Scheduler = match self {
            Strategy::Pipelining(pipelining) => return pipelining.submit(handler),
            Strategy::Direct(direct) => direct,
            Strategy::Threaded(threaded) => threaded,
            Strategy::Iterative(iterative) => iterative,
        };

        let alive = alive.clone();
        let mut handler = handler;
        scheduler.submit(Box::new(move || run_to_completion(handler.as_mut(), &alive)))
    }

    pub fn active(&self) -> usize {
        match self {
            Strategy::Direct(s) => s.active(),
            Strategy::Threaded(s) => s.active(),
            Strategy::Iterative(s) => s.active(),
            Strategy::Pipelining(s) => s.active(),
        }
    }

    pub fn shutdown(&self, drain: Duration) {
        match self {
            Strategy::Direct(s) => s.shutdown(drain),
            Strategy::Threaded(s) => s.shutdown(drain),
            Strategy::Iterative(s) => s.shutdown(drain),
            Strategy::Pipelining(s) => s.shutdown(drain),
        }
    }
}
