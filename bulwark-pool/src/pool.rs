use crate::config::{InvalidPoolConfig, PoolConfig};
use crate::error::PoolError;
use crate::queue::{AdmissionQueue, OfferError, PoolCounts, Polled, RetryOfferError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// A unit of work executed by an [`ElasticPool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool that grows before it queues.
///
/// See the [crate docs](crate) for the admission rules.
///
/// Dropping the pool shuts it down: queued tasks are still executed,
/// but no new task is accepted. Use [`Self::join`] to wait for the workers.
pub struct ElasticPool {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    counts: Arc<WorkerCounts>,
    queue: AdmissionQueue<Task>,
    idle_timeout: Duration,
    retry_offer_timeout: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

#[derive(Debug)]
struct WorkerCounts {
    current: AtomicUsize,
    active: AtomicUsize,
    core: usize,
    max: usize,
    shutdown: AtomicBool,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

impl PoolCounts for WorkerCounts {
    fn current_workers(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn max_workers(&self) -> usize {
        self.max
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Point-in-time view on an [`ElasticPool`], meant for gauge reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live workers, busy or idle.
    pub current_workers: usize,
    /// Workers currently running a task.
    pub active_workers: usize,
    /// Tasks waiting in the admission queue.
    pub queued_tasks: usize,
    /// Configured core size.
    pub core_workers: usize,
    /// Configured maximum size.
    pub max_workers: usize,
    /// Configured queue capacity.
    pub queue_capacity: usize,
    /// Tasks that ran to completion, panicked ones included.
    pub completed_tasks: u64,
    /// Tasks rejected because of overload.
    pub rejected_tasks: u64,
    /// Tasks that panicked.
    pub panicked_tasks: u64,
}

enum Spawned {
    Started,
    AtLimit(Option<Task>),
}

impl ElasticPool {
    /// Create a new [`ElasticPool`].
    ///
    /// No worker is started until the first task is submitted,
    /// use [`Self::prestart_core_workers`] to start the core workers upfront.
    ///
    /// # Errors
    ///
    /// Returns an error if the config does not pass [`PoolConfig::validate`].
    pub fn new(config: PoolConfig) -> Result<Self, InvalidPoolConfig> {
        config.validate()?;

        let counts = Arc::new(WorkerCounts {
            current: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            core: config.core_workers,
            max: config.max_workers,
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let queue = AdmissionQueue::new(config.queue_capacity);
        queue.attach(counts.clone());

        tracing::debug!(
            pool.name = %config.name,
            pool.core = config.core_workers,
            pool.max = config.max_workers,
            pool.queue_capacity = config.queue_capacity,
            "elastic pool created",
        );

        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name,
                counts,
                queue,
                idle_timeout: config.idle_timeout,
                retry_offer_timeout: config.retry_offer_timeout,
                handles: Mutex::new(Vec::new()),
                next_worker_id: AtomicUsize::new(0),
            }),
        })
    }

    /// Submit a task to the pool.
    ///
    /// The task runs on an idle worker if one exists, on a newly spawned worker
    /// while the pool is below its maximum, or is queued once the pool is at its maximum.
    /// When the queue is full as well, this call blocks for at most the configured
    /// retry-offer timeout waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an overload error if no capacity could be found,
    /// and a shutdown error if the pool is shut down. The task is dropped in both cases.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Box::new(task))
    }

    /// Same as [`Self::submit`] but for an already boxed [`Task`].
    ///
    /// # Errors
    ///
    /// See [`Self::submit`].
    pub fn execute(&self, task: Task) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.counts.is_shutdown() {
            return Err(PoolError::shutdown());
        }

        // below core size a worker is always spawned, even if others are idle
        let task = match shared.spawn_worker(Some(task), shared.counts.core)? {
            Spawned::Started => return Ok(()),
            Spawned::AtLimit(task) => task,
        };
        let Some(task) = task else {
            return Ok(());
        };

        let task = match shared.queue.offer(task) {
            Ok(()) => {
                // the last worker may have been reclaimed in between
                if shared.counts.current_workers() == 0 {
                    shared.spawn_worker(None, shared.counts.max)?;
                }
                return Ok(());
            }
            Err(OfferError::Grow(task) | OfferError::Full(task)) => task,
            Err(OfferError::Closed(_)) => return Err(PoolError::shutdown()),
            Err(OfferError::Detached(_)) => return Err(shared.reject()),
        };

        let task = match shared.spawn_worker(Some(task), shared.counts.max)? {
            Spawned::Started => return Ok(()),
            Spawned::AtLimit(task) => task,
        };
        let Some(task) = task else {
            return Ok(());
        };

        match shared.queue.retry_offer(task, shared.retry_offer_timeout) {
            Ok(()) => Ok(()),
            Err(RetryOfferError::Shutdown(_)) => Err(PoolError::shutdown()),
            Err(RetryOfferError::Timeout(_)) => Err(shared.reject()),
        }
    }

    /// Start workers until the core size is reached.
    ///
    /// Returns the amount of workers started.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refused to spawn a worker thread.
    pub fn prestart_core_workers(&self) -> Result<usize, PoolError> {
        let mut started = 0;
        while let Spawned::Started = self.shared.spawn_worker(None, self.shared.counts.core)? {
            started += 1;
        }
        Ok(started)
    }

    /// Stop accepting new tasks.
    ///
    /// Queued tasks are still executed, after which the workers exit.
    pub fn shutdown(&self) {
        if self.shared.counts.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.close();
        tracing::debug!(
            pool.name = %self.shared.name,
            pool.queued = self.shared.queue.len(),
            "elastic pool shutdown: draining queue",
        );
    }

    /// Stop accepting new tasks and discard the queued ones.
    ///
    /// Tasks already running are not interrupted.
    /// Returns the amount of discarded tasks.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        let discarded = self.shared.queue.drain().len();
        if discarded > 0 {
            tracing::debug!(
                pool.name = %self.shared.name,
                "elastic pool shutdown: discarded {discarded} queued tasks",
            );
        }
        discarded
    }

    /// Whether [`Self::shutdown`] was called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.counts.is_shutdown()
    }

    /// Block until every worker has exited.
    ///
    /// Only returns once the pool is shut down and its queue is drained,
    /// so call [`Self::shutdown`] first.
    pub fn join(&self) {
        loop {
            let handles = std::mem::take(&mut *self.shared.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!(pool.name = %self.shared.name, "elastic pool worker panicked");
                }
            }
        }
    }

    /// Live counts of the pool.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let counts = &self.shared.counts;
        PoolStats {
            current_workers: counts.current_workers(),
            active_workers: counts.active_workers(),
            queued_tasks: self.shared.queue.len(),
            core_workers: counts.core,
            max_workers: counts.max,
            queue_capacity: self.shared.queue.capacity(),
            completed_tasks: counts.completed.load(Ordering::Relaxed),
            rejected_tasks: counts.rejected.load(Ordering::Relaxed),
            panicked_tasks: counts.panicked.load(Ordering::Relaxed),
        }
    }

    /// Read-only view on the live worker counts,
    /// the same view the admission queue decides on.
    #[must_use]
    pub fn counts(&self) -> Arc<dyn PoolCounts> {
        self.shared.counts.clone()
    }
}

impl fmt::Debug for ElasticPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticPool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for ElasticPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Spawn a worker if fewer than `limit` workers are alive.
    ///
    /// A worker started with a first task counts as active right away,
    /// so concurrent submitters never mistake it for an idle one.
    fn spawn_worker(self: &Arc<Self>, first: Option<Task>, limit: usize) -> Result<Spawned, PoolError> {
        if self
            .counts
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_err()
        {
            return Ok(Spawned::AtLimit(first));
        }

        let has_first = first.is_some();
        if has_first {
            self.counts.active.fetch_add(1, Ordering::AcqRel);
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{id}", self.name))
            .spawn(move || shared.run_worker(first));

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
                tracing::trace!(pool.name = %self.name, worker.id = id, "elastic pool: worker spawned");
                Ok(Spawned::Started)
            }
            Err(err) => {
                if has_first {
                    self.counts.active.fetch_sub(1, Ordering::AcqRel);
                }
                self.counts.current.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(pool.name = %self.name, "elastic pool: failed to spawn worker: {err}");
                Err(PoolError::spawn(err))
            }
        }
    }

    fn run_worker(&self, mut first: Option<Task>) {
        loop {
            let task = match first.take() {
                Some(task) => task,
                None => match self.next_task() {
                    Some(task) => {
                        self.counts.active.fetch_add(1, Ordering::AcqRel);
                        task
                    }
                    None => return,
                },
            };

            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                self.counts.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(pool.name = %self.name, "elastic pool: task panicked");
            }

            self.counts.active.fetch_sub(1, Ordering::AcqRel);
            self.counts.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait for the next queued task.
    ///
    /// Returns `None` when this worker should exit,
    /// in which case its slot is already released.
    fn next_task(&self) -> Option<Task> {
        loop {
            match self.queue.poll(self.idle_timeout) {
                Polled::Task(task) => return Some(task),
                Polled::Closed => {
                    self.counts.current.fetch_sub(1, Ordering::AcqRel);
                    return None;
                }
                Polled::TimedOut => {
                    let core = if self.counts.is_shutdown() && self.queue.is_empty() {
                        0
                    } else {
                        self.counts.core
                    };
                    if self
                        .counts
                        .current
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                            (current > core).then(|| current - 1)
                        })
                        .is_ok()
                    {
                        // a task queued while this worker was leaving is stranded
                        // if no other worker is left to poll it
                        if !self.queue.is_empty()
                            && self
                                .counts
                                .current
                                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                                    (current == 0).then_some(1)
                                })
                                .is_ok()
                        {
                            continue;
                        }
                        tracing::trace!(pool.name = %self.name, "elastic pool: idle worker reclaimed");
                        return None;
                    }
                }
            }
        }
    }

    fn reject(&self) -> PoolError {
        self.counts.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            pool.name = %self.name,
            pool.current = self.counts.current_workers(),
            pool.active = self.counts.active_workers(),
            pool.queued = self.queue.len(),
            "elastic pool: task rejected, pool and queue saturated",
        );
        PoolError::overload()
    }
}
