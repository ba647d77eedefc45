//! A bounded task queue that knows about the pool draining it.
//!
//! A classic bounded queue accepts whatever fits. The [`AdmissionQueue`] instead
//! looks at the live counts of the worker pool that drains it (via [`PoolCounts`])
//! and declines tasks while the pool still has room to grow, so that the pool
//! spawns a new worker instead of letting the task sit in the queue.
//!
//! The decision itself is the pure function [`admission_decision`].

use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Read-only view on the live counts of a worker pool.
///
/// The [`AdmissionQueue`] only ever reads these counts,
/// sizing the pool is left to the pool itself.
pub trait PoolCounts: Send + Sync + 'static {
    /// Live workers, busy or idle.
    fn current_workers(&self) -> usize;

    /// Workers currently running a task.
    fn active_workers(&self) -> usize;

    /// Configured upper bound of live workers.
    fn max_workers(&self) -> usize;

    /// Whether the pool no longer accepts work.
    fn is_shutdown(&self) -> bool;
}

impl<P: PoolCounts> PoolCounts for Arc<P> {
    fn current_workers(&self) -> usize {
        (**self).current_workers()
    }

    fn active_workers(&self) -> usize {
        (**self).active_workers()
    }

    fn max_workers(&self) -> usize {
        (**self).max_workers()
    }

    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }
}

/// Outcome of [`admission_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// An idle worker exists: queue the task, it is picked up right away.
    Enqueue,
    /// All workers are busy but the pool can still grow:
    /// do not queue, let the pool spawn a worker instead.
    Grow,
    /// The pool is at its maximum: queue the task if capacity remains.
    Saturated,
}

/// Decide what to do with a task given the live `current`, `active` and `max` worker counts.
#[must_use]
pub const fn admission_decision(current: usize, active: usize, max: usize) -> Admission {
    if active < current {
        Admission::Enqueue
    } else if current < max {
        Admission::Grow
    } else {
        Admission::Saturated
    }
}

/// Error returned by [`AdmissionQueue::offer`], handing the task back to the caller.
pub enum OfferError<T> {
    /// No pool is attached, so no pool-aware decision can be made.
    ///
    /// This is an overload condition.
    Detached(T),
    /// The pool can still grow, spawn a worker for this task.
    Grow(T),
    /// The queue has no capacity left.
    Full(T),
    /// The queue is closed because its pool shut down.
    Closed(T),
}

impl<T> OfferError<T> {
    /// Take back the task that was not accepted.
    pub fn into_inner(self) -> T {
        match self {
            Self::Detached(task) | Self::Grow(task) | Self::Full(task) | Self::Closed(task) => task,
        }
    }

    /// Whether the caller should treat this as an overload
    /// rather than as a signal to grow the pool or retry.
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::Detached(_) | Self::Closed(_))
    }
}

impl<T> fmt::Debug for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached(_) => f.write_str("Detached(..)"),
            Self::Grow(_) => f.write_str("Grow(..)"),
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached(_) => f.write_str("admission queue has no pool attached"),
            Self::Grow(_) => f.write_str("admission queue declined task: pool can grow"),
            Self::Full(_) => f.write_str("admission queue is full"),
            Self::Closed(_) => f.write_str("admission queue is closed"),
        }
    }
}

impl<T> std::error::Error for OfferError<T> {}

/// Error returned by [`AdmissionQueue::retry_offer`], handing the task back to the caller.
pub enum RetryOfferError<T> {
    /// The pool is shut down, the task was never queued.
    Shutdown(T),
    /// No capacity freed up within the timeout.
    Timeout(T),
}

impl<T> RetryOfferError<T> {
    /// Take back the task that was not accepted.
    pub fn into_inner(self) -> T {
        match self {
            Self::Shutdown(task) | Self::Timeout(task) => task,
        }
    }
}

impl<T> fmt::Debug for RetryOfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown(_) => f.write_str("Shutdown(..)"),
            Self::Timeout(_) => f.write_str("Timeout(..)"),
        }
    }
}

impl<T> fmt::Display for RetryOfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown(_) => f.write_str("admission queue rejected task: pool is shut down"),
            Self::Timeout(_) => f.write_str("admission queue rejected task: timed out"),
        }
    }
}

impl<T> std::error::Error for RetryOfferError<T> {}

/// Result of [`AdmissionQueue::poll`].
#[derive(Debug)]
pub enum Polled<T> {
    /// A task was taken from the queue.
    Task(T),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The queue is closed and fully drained.
    Closed,
}

/// A bounded blocking queue whose acceptance depends on the live counts of its pool.
///
/// See the [module docs](self) for the acceptance rules.
pub struct AdmissionQueue<T> {
    // `None` once closed, workers then drain what is left and see the channel disconnect
    sender: RwLock<Option<Sender<T>>>,
    receiver: Receiver<T>,
    capacity: usize,
    counts: OnceLock<Arc<dyn PoolCounts>>,
}

impl<T> fmt::Debug for AdmissionQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("len", &self.receiver.len())
            .field("capacity", &self.capacity)
            .field("attached", &self.counts.get().is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> AdmissionQueue<T> {
    /// Create a new [`AdmissionQueue`] able to hold up to `capacity` tasks.
    ///
    /// The queue declines every offer until a pool is attached using [`Self::attach`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            capacity,
            counts: OnceLock::new(),
        }
    }

    /// Attach the counts of the pool that drains this queue.
    ///
    /// Returns `false` if a pool was already attached, in which case
    /// the existing one is kept.
    pub fn attach(&self, counts: Arc<dyn PoolCounts>) -> bool {
        self.counts.set(counts).is_ok()
    }

    /// Offer a task to the queue, deciding based on the live pool counts.
    ///
    /// # Errors
    ///
    /// Hands the task back when it is not accepted, see [`OfferError`] for the reasons.
    pub fn offer(&self, task: T) -> Result<(), OfferError<T>> {
        let Some(counts) = self.counts.get() else {
            return Err(OfferError::Detached(task));
        };

        let current = counts.current_workers();
        let active = counts.active_workers();
        let max = counts.max_workers();

        if admission_decision(current, active, max) == Admission::Grow {
            tracing::trace!(current, active, max, "admission queue: decline task, pool can grow");
            return Err(OfferError::Grow(task));
        }

        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(OfferError::Closed(task));
        };
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => Err(OfferError::Full(task)),
            Err(TrySendError::Disconnected(task)) => Err(OfferError::Closed(task)),
        }
    }

    /// Last resort enqueue: wait up to `timeout` for queue capacity to free up.
    ///
    /// This is the only operation of the queue that blocks the calling thread.
    ///
    /// # Errors
    ///
    /// Fails immediately if the pool is shut down, and hands the task back
    /// if no capacity freed up within the timeout.
    pub fn retry_offer(&self, task: T, timeout: Duration) -> Result<(), RetryOfferError<T>> {
        if self.counts.get().is_some_and(|counts| counts.is_shutdown()) {
            return Err(RetryOfferError::Shutdown(task));
        }
        // clone so that closing the queue never waits on a blocked submitter
        let Some(sender) = self.sender.read().clone() else {
            return Err(RetryOfferError::Shutdown(task));
        };
        match sender.send_timeout(task, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(task)) => Err(RetryOfferError::Timeout(task)),
            Err(SendTimeoutError::Disconnected(task)) => Err(RetryOfferError::Shutdown(task)),
        }
    }

    /// Take the next task, waiting up to `timeout` for one to arrive.
    pub fn poll(&self, timeout: Duration) -> Polled<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => Polled::Task(task),
            Err(RecvTimeoutError::Timeout) => Polled::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Polled::Closed,
        }
    }

    /// Close the queue: no new task is accepted, queued tasks can still be polled.
    ///
    /// Returns `false` if the queue was already closed.
    pub fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Remove and return all queued tasks.
    pub fn drain(&self) -> Vec<T> {
        self.receiver.drain().collect()
    }

    /// Amount of queued tasks.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no task is queued.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Maximum amount of queued tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Debug, Default)]
    struct FixedCounts {
        current: AtomicUsize,
        active: AtomicUsize,
        max: usize,
        shutdown: AtomicBool,
    }

    impl FixedCounts {
        fn new(current: usize, active: usize, max: usize) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(current),
                active: AtomicUsize::new(active),
                max,
                shutdown: AtomicBool::new(false),
            })
        }
    }

    impl PoolCounts for FixedCounts {
        fn current_workers(&self) -> usize {
            self.current.load(Ordering::SeqCst)
        }

        fn active_workers(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        fn max_workers(&self) -> usize {
            self.max
        }

        fn is_shutdown(&self) -> bool {
            self.shutdown.load(Ordering::SeqCst)
        }
    }

    fn queue_with(counts: Arc<FixedCounts>, capacity: usize) -> AdmissionQueue<u32> {
        let queue = AdmissionQueue::new(capacity);
        assert!(queue.attach(counts));
        queue
    }

    #[test]
    fn offer_accepts_when_idle_worker_exists() {
        let queue = queue_with(FixedCounts::new(2, 1, 4), 8);
        assert!(queue.offer(1).is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn offer_declines_when_pool_can_grow() {
        let queue = queue_with(FixedCounts::new(2, 2, 4), 8);
        let err = queue.offer(1).unwrap_err();
        assert!(matches!(err, OfferError::Grow(_)));
        assert!(!err.is_overload());
        assert_eq!(err.into_inner(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn offer_queues_when_pool_is_at_max() {
        let queue = queue_with(FixedCounts::new(4, 4, 4), 8);
        assert!(queue.offer(1).is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn offer_full_when_at_max_without_capacity() {
        let queue = queue_with(FixedCounts::new(4, 4, 4), 1);
        queue.offer(1).unwrap();
        assert!(matches!(queue.offer(2), Err(OfferError::Full(2))));
    }

    #[test]
    fn offer_without_pool_is_overload() {
        let queue = AdmissionQueue::new(8);
        let err = queue.offer(1).unwrap_err();
        assert!(matches!(err, OfferError::Detached(1)));
        assert!(err.is_overload());
    }

    #[test]
    fn attach_keeps_first_pool() {
        let queue = AdmissionQueue::<u32>::new(1);
        assert!(queue.attach(FixedCounts::new(0, 0, 1)));
        assert!(!queue.attach(FixedCounts::new(1, 1, 1)));
    }

    #[test]
    fn debug_reports_state_for_any_task_type() {
        // not `Send`
        let queue = AdmissionQueue::<std::rc::Rc<u32>>::new(2);
        assert_eq!(
            format!("{queue:?}"),
            "AdmissionQueue { len: 0, capacity: 2, attached: false, closed: false }"
        );
        assert!(queue.close());
        assert!(format!("{queue:?}").contains("closed: true"));
    }

    #[test]
    fn retry_offer_times_out_when_full() {
        let queue = queue_with(FixedCounts::new(1, 1, 1), 1);
        queue.offer(1).unwrap();

        let start = Instant::now();
        let err = queue.retry_offer(2, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, RetryOfferError::Timeout(2)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn retry_offer_succeeds_once_capacity_frees_up() {
        let queue = Arc::new(queue_with(FixedCounts::new(1, 1, 1), 1));
        queue.offer(1).unwrap();

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                matches!(queue.poll(Duration::from_secs(1)), Polled::Task(1))
            })
        };

        queue.retry_offer(2, Duration::from_secs(5)).unwrap();
        assert!(consumer.join().unwrap());
        assert!(matches!(queue.poll(Duration::ZERO), Polled::Task(2)));
    }

    #[test]
    fn retry_offer_fails_fast_on_shutdown() {
        let counts = FixedCounts::new(1, 1, 1);
        let queue = queue_with(counts.clone(), 1);
        queue.offer(1).unwrap();
        counts.shutdown.store(true, Ordering::SeqCst);

        let start = Instant::now();
        let err = queue.retry_offer(2, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, RetryOfferError::Shutdown(2)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn closed_queue_drains_then_reports_closed() {
        let queue = queue_with(FixedCounts::new(1, 0, 1), 4);
        queue.offer(1).unwrap();
        queue.offer(2).unwrap();

        assert!(queue.close());
        assert!(!queue.close());
        assert!(matches!(queue.offer(3), Err(OfferError::Closed(3))));

        assert!(matches!(queue.poll(Duration::ZERO), Polled::Task(1)));
        assert_eq!(queue.drain(), vec![2]);
        assert!(matches!(queue.poll(Duration::from_millis(5)), Polled::Closed));
    }

    #[test]
    fn decision_table() {
        assert_eq!(admission_decision(2, 1, 4), Admission::Enqueue);
        assert_eq!(admission_decision(2, 2, 4), Admission::Grow);
        assert_eq!(admission_decision(4, 4, 4), Admission::Saturated);
        assert_eq!(admission_decision(0, 0, 4), Admission::Grow);
    }

    #[quickcheck]
    fn decision_never_grows_at_max(current: u8, active: u8, max: u8) -> bool {
        let (current, active, max) = (current as usize, active as usize, max as usize);
        let decision = admission_decision(current, active, max);
        match decision {
            Admission::Enqueue => active < current,
            Admission::Grow => active >= current && current < max,
            Admission::Saturated => active >= current && current >= max,
        }
    }
}
