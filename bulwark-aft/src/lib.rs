//! Adaptive fault tolerance for bulwark.
//!
//! Every consumer-to-provider channel, an [`InvocationDimension`], gets an
//! [`InvocationStat`] counting invocations and abnormal outcomes per time window.
//! Once per window the [`Regulator`] compares every endpoint of a service with
//! its peers ([`measure`]): an endpoint failing far more often than its peers
//! gets its routing weight lowered, and it is brought back gradually once it
//! behaves again.
//!
//! # Example
//!
//! ```
//! use bulwark_aft::{
//!     FaultTolerance, FaultToleranceConfig, FaultToleranceConfigs, InvocationDimension, Outcome,
//! };
//!
//! let aft = FaultTolerance::new(FaultToleranceConfigs::default().with_app(
//!     "shop",
//!     FaultToleranceConfig::default().with_regulation_effective(true),
//! ))
//! .unwrap();
//!
//! let endpoints: Vec<_> = ["10.0.0.1:12200", "10.0.0.2:12200", "10.0.0.3:12200"]
//!     .into_iter()
//!     .map(|endpoint| InvocationDimension::new(endpoint, "shop", "OrderService"))
//!     .collect();
//! for dimension in &endpoints {
//!     aft.register_endpoint(dimension.clone(), 100);
//! }
//!
//! for n in 0..100 {
//!     aft.record(&endpoints[0], if n < 5 { Outcome::Abnormal } else { Outcome::Success });
//!     aft.record(&endpoints[1], if n < 5 { Outcome::Abnormal } else { Outcome::Success });
//!     aft.record(&endpoints[2], if n < 90 { Outcome::Abnormal } else { Outcome::Success });
//! }
//!
//! aft.regulate();
//! assert_eq!(aft.effective_weight(&endpoints[0]), Some(100));
//! assert_eq!(aft.effective_weight(&endpoints[2]), Some(5));
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod config;
#[doc(inline)]
pub use config::{
    FaultToleranceConfig, FaultToleranceConfigs, InvalidFaultToleranceConfig, LiveConfigs,
};

mod dimension;
pub use dimension::{InvocationDimension, ModelKey};

mod stat;
pub use stat::{InvocationStat, InvocationStatSnapshot, Outcome};

pub mod registry;
#[doc(inline)]
pub use registry::{InvocationStatListener, InvocationStatRegistry};

pub mod measure;
#[doc(inline)]
pub use measure::{
    MeasureModel, MeasureModels, MeasureResult, MeasureResultDetail, MeasureState, measure,
};

pub mod weight;
#[doc(inline)]
pub use weight::{
    DegradeCurve, EndpointWeight, EndpointWeightSnapshot, EndpointWeights, WarmupRamp,
    WeightStatus,
};

mod regulator;
pub use regulator::{RegulationListener, Regulator};

mod fault_tolerance;
pub use fault_tolerance::FaultTolerance;
