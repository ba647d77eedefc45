//! Resiliency core for RPC frameworks.
//!
//! bulwark protects both sides of an RPC call:
//!
//! | side | crate | what it does |
//! |-|-|-|
//! | server | [`pool`] | elastic admission control: grow the worker pool before queueing, shed load once pool and queue are saturated |
//! | client | [`aft`] | adaptive fault tolerance: lower the routing weight of endpoints that fail far more often than their peers, and bring them back once healthy |
//!
//! Both are enabled by default and can be opted out of with the `pool` and `aft` features.
//!
//! # Example
//!
//! A consumer that dispatches calls on an [`ElasticPool`] and reports
//! every outcome to [`FaultTolerance`]:
//!
//! ```
//! use bulwark::aft::{
//!     FaultTolerance, FaultToleranceConfig, FaultToleranceConfigs, InvocationDimension, Outcome,
//! };
//! use bulwark::pool::{ElasticPool, PoolConfig};
//! use std::sync::mpsc;
//!
//! let aft = FaultTolerance::new(FaultToleranceConfigs::default().with_app(
//!     "shop",
//!     FaultToleranceConfig::default().with_regulation_effective(true),
//! ))
//! .unwrap();
//! let pool = ElasticPool::new(PoolConfig::default().with_core_workers(1)).unwrap();
//!
//! let dimension = InvocationDimension::new("10.0.0.1:12200", "shop", "OrderService");
//! aft.register_endpoint(dimension.clone(), 100);
//!
//! let (tx, rx) = mpsc::channel();
//! let recorder = aft.clone();
//! pool.submit(move || {
//!     let result: Result<(), &str> = Ok(());
//!     recorder.record(&dimension, Outcome::from_result(&result));
//!     tx.send(()).unwrap();
//! })
//! .unwrap();
//!
//! rx.recv().unwrap();
//! assert_eq!(aft.registry().len(), 1);
//! ```
//!
//! [`ElasticPool`]: crate::pool::ElasticPool
//! [`FaultTolerance`]: crate::aft::FaultTolerance

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]

#[doc(inline)]
pub use bulwark_error as error;

#[doc(inline)]
pub use bulwark_utils as utils;

#[cfg(feature = "pool")]
#[cfg_attr(docsrs, doc(cfg(feature = "pool")))]
#[doc(inline)]
pub use bulwark_pool as pool;

#[cfg(feature = "aft")]
#[cfg_attr(docsrs, doc(cfg(feature = "aft")))]
#[doc(inline)]
pub use bulwark_aft as aft;
