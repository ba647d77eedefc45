//! Configuration of adaptive fault tolerance.
//!
//! Thresholds are configured per consuming application,
//! falling back to a default for applications without their own entry.
//! [`LiveConfigs`] holds the configuration in use and can be swapped
//! at runtime without blocking the invocation hot path.

use crate::weight::{DegradeCurve, WarmupRamp};
use arc_swap::ArcSwap;
use bulwark_utils::time::serde_millis;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fault tolerance thresholds of one application.
///
/// Durations are (de)serialized as milliseconds, missing fields fall back to their default:
///
/// ```
/// use bulwark_aft::FaultToleranceConfig;
///
/// let config: FaultToleranceConfig = serde_json::from_str(r#"{
///     "regulation_effective": true,
///     "least_window_count": 20,
///     "degrade_curve": { "kind": "step", "step": 10 }
/// }"#).unwrap();
///
/// assert!(config.regulation_effective);
/// assert!(config.degrade_effective);
/// assert_eq!(config.least_window_count, 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfig {
    /// Collect statistics and measure this application at all.
    pub regulation_effective: bool,
    /// Apply degrade decisions to weights; when `false` they are only logged.
    pub degrade_effective: bool,
    /// Minimal invocations in a window before an endpoint is judged.
    pub least_window_count: u64,
    /// How many times the peer average abnormal rate an endpoint must exceed
    /// before it is degraded.
    pub least_abnormal_rate_multiple: f64,
    /// Peer average abnormal rate at or below which nothing is degraded.
    ///
    /// The comparison is strict, so with the default of `0.0` an endpoint
    /// whose peers had no abnormal invocation at all in the window is never
    /// degraded, however often it fails itself: there is no peer baseline
    /// to multiply. A single abnormal peer invocation is enough to lift
    /// the average above `0.0`.
    pub abnormal_rate_noise_floor: f64,
    /// How a degrade decision lowers the weight.
    pub degrade_curve: DegradeCurve,
    /// Weight a degraded endpoint never goes below.
    pub degrade_least_weight: u32,
    /// Maximum endpoints of the application degraded at the same time.
    pub degrade_max_endpoints: usize,
    /// Multiplier applied to a degraded weight for every healthy window.
    pub recover_rate: f64,
    /// Consecutive healthy windows after which the original weight is restored.
    pub recover_cycles: u32,
    /// Shape of the climb back to the original weight once restored.
    pub recover_ramp: WarmupRamp,
    /// Duration of that climb, zero restores at once.
    #[serde(with = "serde_millis", rename = "recover_warmup_ms")]
    pub recover_warmup: Duration,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            regulation_effective: false,
            degrade_effective: true,
            least_window_count: 10,
            least_abnormal_rate_multiple: 6.0,
            abnormal_rate_noise_floor: 0.0,
            degrade_curve: DegradeCurve::default(),
            degrade_least_weight: 1,
            degrade_max_endpoints: 2,
            recover_rate: 2.0,
            recover_cycles: 3,
            recover_ramp: WarmupRamp::default(),
            recover_warmup: Duration::ZERO,
        }
    }
}

impl FaultToleranceConfig {
    /// Turn regulation on or off.
    #[must_use]
    pub fn with_regulation_effective(mut self, effective: bool) -> Self {
        self.regulation_effective = effective;
        self
    }

    /// Apply or only log degrade decisions.
    #[must_use]
    pub fn with_degrade_effective(mut self, effective: bool) -> Self {
        self.degrade_effective = effective;
        self
    }

    /// Set the minimal invocations in a window.
    #[must_use]
    pub fn with_least_window_count(mut self, count: u64) -> Self {
        self.least_window_count = count;
        self
    }

    /// Set the abnormal rate multiple.
    #[must_use]
    pub fn with_least_abnormal_rate_multiple(mut self, multiple: f64) -> Self {
        self.least_abnormal_rate_multiple = multiple;
        self
    }

    /// Set the noise floor of the peer average.
    ///
    /// See [`Self::abnormal_rate_noise_floor`] for a peer average of zero.
    #[must_use]
    pub fn with_abnormal_rate_noise_floor(mut self, floor: f64) -> Self {
        self.abnormal_rate_noise_floor = floor;
        self
    }

    /// Set the degrade curve.
    #[must_use]
    pub fn with_degrade_curve(mut self, curve: DegradeCurve) -> Self {
        self.degrade_curve = curve;
        self
    }

    /// Set the weight floor.
    #[must_use]
    pub fn with_degrade_least_weight(mut self, weight: u32) -> Self {
        self.degrade_least_weight = weight;
        self
    }

    /// Set the maximum simultaneously degraded endpoints.
    #[must_use]
    pub fn with_degrade_max_endpoints(mut self, max: usize) -> Self {
        self.degrade_max_endpoints = max;
        self
    }

    /// Set the partial recovery multiplier.
    #[must_use]
    pub fn with_recover_rate(mut self, rate: f64) -> Self {
        self.recover_rate = rate;
        self
    }

    /// Set the healthy windows needed for a full recovery.
    #[must_use]
    pub fn with_recover_cycles(mut self, cycles: u32) -> Self {
        self.recover_cycles = cycles;
        self
    }

    /// Set the warm-up used once the original weight is restored.
    #[must_use]
    pub fn with_recover_warmup(mut self, ramp: WarmupRamp, duration: Duration) -> Self {
        self.recover_ramp = ramp;
        self.recover_warmup = duration;
        self
    }

    /// Validate the config.
    ///
    /// # Errors
    ///
    /// Returns a config validation error if:
    /// - `least_window_count` is zero;
    /// - `least_abnormal_rate_multiple` is not a finite number of at least 1;
    /// - `abnormal_rate_noise_floor` is not within `[0, 1)`;
    /// - the degrade curve would not lower any weight;
    /// - `recover_rate` is not a finite number above 1;
    /// - `recover_cycles` is zero.
    pub fn validate(&self) -> Result<(), InvalidFaultToleranceConfig> {
        if self.least_window_count == 0 {
            return Err(InvalidFaultToleranceConfig(
                "least window count must be non-zero",
            ));
        }
        if !(self.least_abnormal_rate_multiple.is_finite()
            && self.least_abnormal_rate_multiple >= 1.0)
        {
            return Err(InvalidFaultToleranceConfig(
                "least abnormal rate multiple must be a finite number of at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.abnormal_rate_noise_floor) {
            return Err(InvalidFaultToleranceConfig(
                "abnormal rate noise floor must be within [0, 1)",
            ));
        }
        self.degrade_curve
            .validate()
            .map_err(InvalidFaultToleranceConfig)?;
        if !(self.recover_rate.is_finite() && self.recover_rate > 1.0) {
            return Err(InvalidFaultToleranceConfig(
                "recover rate must be a finite number above 1",
            ));
        }
        if self.recover_cycles == 0 {
            return Err(InvalidFaultToleranceConfig(
                "recover cycles must be non-zero",
            ));
        }
        Ok(())
    }
}

/// The configuration of all applications in this process.
///
/// ```
/// use bulwark_aft::{FaultToleranceConfig, FaultToleranceConfigs};
///
/// let configs: FaultToleranceConfigs = serde_json::from_str(r#"{
///     "time_window_ms": 5000,
///     "apps": { "shop": { "regulation_effective": true } }
/// }"#).unwrap();
///
/// assert!(configs.is_enabled("shop"));
/// assert!(!configs.is_enabled("cart"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfigs {
    /// Length of a measurement window, which is also the regulation period.
    #[serde(with = "serde_millis", rename = "time_window_ms")]
    pub time_window: Duration,
    /// Config of applications without an entry of their own.
    pub default: FaultToleranceConfig,
    /// Per application configs.
    pub apps: ahash::HashMap<SmolStr, FaultToleranceConfig>,
}

impl Default for FaultToleranceConfigs {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs(10),
            default: FaultToleranceConfig::default(),
            apps: ahash::HashMap::default(),
        }
    }
}

impl FaultToleranceConfigs {
    /// Set the measurement window.
    #[must_use]
    pub fn with_time_window(mut self, window: Duration) -> Self {
        self.time_window = window;
        self
    }

    /// Set the config of applications without an entry of their own.
    #[must_use]
    pub fn with_default(mut self, config: FaultToleranceConfig) -> Self {
        self.default = config;
        self
    }

    /// Set the config of one application.
    #[must_use]
    pub fn with_app(mut self, app: impl Into<SmolStr>, config: FaultToleranceConfig) -> Self {
        self.apps.insert(app.into(), config);
        self
    }

    /// Config that applies to `app`.
    #[must_use]
    pub fn config_for(&self, app: &str) -> &FaultToleranceConfig {
        self.apps.get(app).unwrap_or(&self.default)
    }

    /// Returns `true` if regulation is in effect for `app`.
    #[must_use]
    pub fn is_enabled(&self, app: &str) -> bool {
        self.config_for(app).regulation_effective
    }

    /// Validate the window and every contained config.
    ///
    /// # Errors
    ///
    /// Returns a config validation error if the time window is zero
    /// or if any of the application configs is invalid.
    pub fn validate(&self) -> Result<(), InvalidFaultToleranceConfig> {
        if self.time_window.is_zero() {
            return Err(InvalidFaultToleranceConfig("time window must be non-zero"));
        }
        self.default.validate()?;
        self.apps.values().try_for_each(FaultToleranceConfig::validate)
    }
}

/// Fault tolerance config validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidFaultToleranceConfig(&'static str);

impl fmt::Display for InvalidFaultToleranceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fault tolerance config: {}", self.0)
    }
}

impl std::error::Error for InvalidFaultToleranceConfig {}

/// Shared, swappable handle to the [`FaultToleranceConfigs`] in use.
///
/// Clones share the same configuration. Readers never block,
/// an update is seen by every read that starts after it.
#[derive(Debug, Clone)]
pub struct LiveConfigs(Arc<ArcSwap<FaultToleranceConfigs>>);

impl LiveConfigs {
    /// Create a new handle.
    ///
    /// # Errors
    ///
    /// Returns an error if `configs` does not [validate](FaultToleranceConfigs::validate).
    pub fn new(configs: FaultToleranceConfigs) -> Result<Self, InvalidFaultToleranceConfig> {
        configs.validate()?;
        Ok(Self(Arc::new(ArcSwap::from_pointee(configs))))
    }

    /// The configuration in use.
    #[must_use]
    pub fn load(&self) -> Arc<FaultToleranceConfigs> {
        self.0.load_full()
    }

    /// Returns `true` if regulation is in effect for `app`.
    #[must_use]
    pub fn is_enabled(&self, app: &str) -> bool {
        self.0.load().is_enabled(app)
    }

    /// Replace the configuration in use.
    ///
    /// A changed time window only applies to regulation loops started afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error, and keeps the current configuration,
    /// if `configs` does not [validate](FaultToleranceConfigs::validate).
    pub fn store(&self, configs: FaultToleranceConfigs) -> Result<(), InvalidFaultToleranceConfig> {
        configs.validate()?;
        self.0.store(Arc::new(configs));
        Ok(())
    }

    /// Replace the configuration of a single application.
    ///
    /// # Errors
    ///
    /// Returns an error, and keeps the current configuration, if `config` is invalid.
    pub fn update_app(
        &self,
        app: impl Into<SmolStr>,
        config: FaultToleranceConfig,
    ) -> Result<(), InvalidFaultToleranceConfig> {
        config.validate()?;
        let app = app.into();
        self.0.rcu(|current| {
            let mut next = FaultToleranceConfigs::clone(current);
            next.apps.insert(app.clone(), config.clone());
            next
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_are_valid_and_disabled() {
        let configs = FaultToleranceConfigs::default();
        configs.validate().unwrap();
        assert!(!configs.is_enabled("shop"));
    }

    #[test]
    fn app_config_overrides_default() {
        let configs = FaultToleranceConfigs::default().with_app(
            "shop",
            FaultToleranceConfig::default()
                .with_regulation_effective(true)
                .with_least_window_count(3),
        );
        assert!(configs.is_enabled("shop"));
        assert_eq!(configs.config_for("shop").least_window_count, 3);
        assert_eq!(configs.config_for("cart").least_window_count, 10);
    }

    #[test]
    fn invalid_configs() {
        let cases = [
            FaultToleranceConfig::default().with_least_window_count(0),
            FaultToleranceConfig::default().with_least_abnormal_rate_multiple(0.5),
            FaultToleranceConfig::default().with_least_abnormal_rate_multiple(f64::INFINITY),
            FaultToleranceConfig::default().with_abnormal_rate_noise_floor(1.0),
            FaultToleranceConfig::default().with_abnormal_rate_noise_floor(-0.1),
            FaultToleranceConfig::default().with_degrade_curve(DegradeCurve::Ratio { rate: 1.5 }),
            FaultToleranceConfig::default().with_recover_rate(1.0),
            FaultToleranceConfig::default().with_recover_cycles(0),
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn invalid_app_config_invalidates_configs() {
        let err = FaultToleranceConfigs::default()
            .with_app("shop", FaultToleranceConfig::default().with_recover_cycles(0))
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid fault tolerance config: recover cycles must be non-zero"
        );
    }

    #[test]
    fn live_configs_reject_invalid_updates() {
        let live = LiveConfigs::new(FaultToleranceConfigs::default()).unwrap();
        assert!(
            live.store(FaultToleranceConfigs::default().with_time_window(Duration::ZERO))
                .is_err()
        );
        assert_eq!(live.load().time_window, Duration::from_secs(10));
    }

    #[test]
    fn live_configs_update_single_app() {
        let live = LiveConfigs::new(FaultToleranceConfigs::default()).unwrap();
        let shared = live.clone();
        shared
            .update_app(
                "shop",
                FaultToleranceConfig::default().with_regulation_effective(true),
            )
            .unwrap();
        assert!(live.is_enabled("shop"));
        assert!(!live.is_enabled("cart"));
    }

    #[test]
    fn serde_round_trip_keeps_millis() {
        let configs = FaultToleranceConfigs::default()
            .with_time_window(Duration::from_millis(2500))
            .with_default(
                FaultToleranceConfig::default()
                    .with_recover_warmup(WarmupRamp::Linear, Duration::from_secs(30)),
            );
        let json = serde_json::to_value(&configs).unwrap();
        assert_eq!(json["time_window_ms"], 2500);
        assert_eq!(json["default"]["recover_warmup_ms"], 30_000);
        assert_eq!(json["default"]["recover_ramp"], "linear");

        let back: FaultToleranceConfigs = serde_json::from_value(json).unwrap();
        assert_eq!(back, configs);
    }
}
