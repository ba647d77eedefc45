//! Elastic admission control for bulwark.
//!
//! An [`ElasticPool`] is a thread pool that prefers growing over queueing:
//!
//! 1. a task is handed to an idle worker when one exists;
//! 2. otherwise a new worker is spawned, as long as the pool is below its maximum;
//! 3. once the pool is at its maximum, tasks are queued in a bounded [`AdmissionQueue`];
//! 4. when that queue is full as well, the submitter waits for a bounded amount of time
//!    for queue capacity to free up (see [`AdmissionQueue::retry_offer`]);
//! 5. and finally, the task is rejected with an overload [`PoolError`].
//!
//! Idle workers above the core size are reclaimed after the configured idle timeout.
//!
//! # Example
//!
//! ```
//! use bulwark_pool::{ElasticPool, PoolConfig};
//! use std::sync::mpsc;
//!
//! let pool = ElasticPool::new(
//!     PoolConfig::default()
//!         .with_core_workers(1)
//!         .with_max_workers(4)
//!         .with_queue_capacity(16),
//! )
//! .unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! pool.submit(move || tx.send(42).unwrap()).unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//!
//! pool.shutdown();
//! pool.join();
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod config;
#[doc(inline)]
pub use config::{InvalidPoolConfig, PoolConfig};

pub mod error;
#[doc(inline)]
pub use error::{PoolError, PoolShutdown, Rejected};

pub mod queue;
#[doc(inline)]
pub use queue::{Admission, AdmissionQueue, PoolCounts, admission_decision};

mod pool;
#[doc(inline)]
pub use pool::{ElasticPool, PoolStats, Task};
