//! The regulation engine: once per window, measure every model and move weights.
//!
//! For each [`MeasureResultDetail`] the regulator:
//!
//! - degrades the weight of a [`MeasureState::Degrade`] dimension, unless degrading
//!   is switched off for the application or too many of its endpoints are degraded already;
//! - partially recovers a degraded dimension measured [`MeasureState::Normal`],
//!   and restores its original weight after enough consecutive healthy windows;
//! - leaves [`MeasureState::LogOnly`] dimensions alone.
//!
//! Failing to regulate one dimension is logged and does not affect the others.

use crate::{
    EndpointWeights, FaultToleranceConfig, InvocationDimension, InvocationStatRegistry,
    LiveConfigs, MeasureModels, MeasureResult, MeasureResultDetail, MeasureState, WarmupRamp,
    measure,
};
use bulwark_error::{BoxError, ErrorContext, OpaqueError};
use bulwark_utils::time::duration_as_millis_u64;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_graceful::ShutdownGuard;

/// Observer of every [`MeasureResult`] produced by a [`Regulator`],
/// after it was applied.
///
/// Listeners run after the weights of the pass were updated and may query
/// the regulator, e.g. for [`Regulator::degraded`]. Calling
/// [`Regulator::regulate`] from a listener skips the nested pass.
pub trait RegulationListener: Send + Sync + 'static {
    /// Called once per model per regulation pass.
    fn on_regulated(&self, result: &MeasureResult) -> Result<(), BoxError>;
}

#[derive(Debug, Default, Clone, Copy)]
struct DimensionState {
    degraded: bool,
    healthy_windows: u32,
}

/// Measures all models and regulates endpoint weights accordingly.
pub struct Regulator {
    registry: Arc<InvocationStatRegistry>,
    models: Arc<MeasureModels>,
    weights: Arc<EndpointWeights>,
    configs: LiveConfigs,
    // held for a whole pass, listeners included
    pass: Mutex<()>,
    states: Mutex<ahash::HashMap<InvocationDimension, DimensionState>>,
    listeners: RwLock<Vec<Arc<dyn RegulationListener>>>,
}

impl fmt::Debug for Regulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regulator")
            .field("registry", &self.registry)
            .field("models", &self.models.len())
            .field("weights", &self.weights)
            .field("configs", &self.configs)
            .finish()
    }
}

impl Regulator {
    /// Create a new [`Regulator`].
    pub fn new(
        registry: Arc<InvocationStatRegistry>,
        models: Arc<MeasureModels>,
        weights: Arc<EndpointWeights>,
        configs: LiveConfigs,
    ) -> Self {
        Self {
            registry,
            models,
            weights,
            configs,
            pass: Mutex::default(),
            states: Mutex::default(),
            listeners: RwLock::default(),
        }
    }

    /// Register a listener for the results of every future regulation pass.
    pub fn add_listener(&self, listener: Arc<dyn RegulationListener>) {
        self.listeners.write().push(listener);
    }

    /// Dimensions whose weight is currently lowered by this regulator.
    #[must_use]
    pub fn degraded(&self) -> Vec<InvocationDimension> {
        let mut degraded: Vec<_> = self
            .states
            .lock()
            .iter()
            .filter(|(_, state)| state.degraded)
            .map(|(dimension, _)| dimension.clone())
            .collect();
        degraded.sort();
        degraded
    }

    /// Run one regulation pass over all models of applications
    /// with regulation in effect, and close their windows.
    ///
    /// A pass started while another one is still running is skipped
    /// and returns no results.
    pub fn regulate(&self) -> Vec<MeasureResult> {
        let Some(_pass) = self.pass.try_lock() else {
            tracing::debug!("regulation pass skipped: previous pass still running");
            return Vec::new();
        };
        let mut states = self.states.lock();

        let configs = self.configs.load();
        let mut results = Vec::new();
        for model in self.models.models() {
            let config = configs.config_for(model.key().app());
            if !config.regulation_effective {
                continue;
            }

            let mut result = measure(&model, config, configs.time_window);
            for detail in &mut result.details {
                let applied = catch_unwind(AssertUnwindSafe(|| {
                    self.apply(&mut states, config, detail)
                }));
                match applied {
                    Ok(Ok(())) => (),
                    Ok(Err(err)) => tracing::warn!(
                        dimension = %detail.dimension,
                        "failed to regulate dimension: {err}"
                    ),
                    Err(_) => tracing::error!(
                        dimension = %detail.dimension,
                        "regulating dimension panicked"
                    ),
                }
            }

            results.push(result);
        }

        self.forget_removed(&mut states);
        drop(states);

        for result in &results {
            self.notify(result);
        }
        results
    }

    fn apply(
        &self,
        states: &mut ahash::HashMap<InvocationDimension, DimensionState>,
        config: &FaultToleranceConfig,
        detail: &mut MeasureResultDetail,
    ) -> Result<(), OpaqueError> {
        match detail.state {
            MeasureState::Recovered => Ok(()),
            MeasureState::LogOnly => {
                tracing::trace!(
                    dimension = %detail.dimension,
                    window.count = detail.window_count,
                    window.least_count = detail.least_window_count,
                    "not enough invocations to regulate dimension"
                );
                Ok(())
            }
            MeasureState::Degrade => self.degrade(states, config, detail),
            MeasureState::Normal => self.recover(states, config, detail),
        }
    }

    fn degrade(
        &self,
        states: &mut ahash::HashMap<InvocationDimension, DimensionState>,
        config: &FaultToleranceConfig,
        detail: &mut MeasureResultDetail,
    ) -> Result<(), OpaqueError> {
        let app = detail.dimension.app();
        let degraded_in_app = states
            .iter()
            .filter(|(dimension, state)| state.degraded && dimension.app() == app)
            .count();
        let state = states.entry(detail.dimension.clone()).or_default();
        state.healthy_windows = 0;

        if !config.degrade_effective {
            detail.log_only = true;
            tracing::info!(
                dimension = %detail.dimension,
                abnormal_rate = detail.abnormal_rate,
                average_abnormal_rate = detail.average_abnormal_rate,
                "dimension would be degraded, degrading is not in effect"
            );
            return Ok(());
        }
        if !state.degraded && degraded_in_app >= config.degrade_max_endpoints {
            detail.log_only = true;
            tracing::info!(
                dimension = %detail.dimension,
                degraded = degraded_in_app,
                "dimension not degraded: application reached its maximum of degraded endpoints"
            );
            return Ok(());
        }

        let weight = self
            .weights
            .get(&detail.dimension)
            .context("no routing weight registered")?;
        match weight.degrade(config.degrade_curve, config.degrade_least_weight) {
            Some(to) => {
                state.degraded = true;
                tracing::info!(
                    dimension = %detail.dimension,
                    abnormal_rate = detail.abnormal_rate,
                    average_abnormal_rate = detail.average_abnormal_rate,
                    weight.original = weight.original_weight(),
                    weight.to = to,
                    "dimension degraded"
                );
            }
            None if state.degraded => {
                tracing::debug!(
                    dimension = %detail.dimension,
                    "degraded dimension already at its least weight"
                );
            }
            None => {
                detail.log_only = true;
                tracing::debug!(
                    dimension = %detail.dimension,
                    "dimension not degraded: weight already at its least weight"
                );
            }
        }
        Ok(())
    }

    fn recover(
        &self,
        states: &mut ahash::HashMap<InvocationDimension, DimensionState>,
        config: &FaultToleranceConfig,
        detail: &mut MeasureResultDetail,
    ) -> Result<(), OpaqueError> {
        let Some(state) = states
            .get_mut(&detail.dimension)
            .filter(|state| state.degraded)
        else {
            return Ok(());
        };
        state.healthy_windows += 1;

        let weight = self
            .weights
            .get(&detail.dimension)
            .context("no routing weight registered")?;

        if state.healthy_windows >= config.recover_cycles {
            weight.restore(config.recover_ramp, config.recover_warmup);
            *state = DimensionState::default();
            detail.state = MeasureState::Recovered;
            detail.recovered_origin_weight = true;
            tracing::info!(
                dimension = %detail.dimension,
                weight.original = weight.original_weight(),
                "dimension recovered"
            );
        } else if let Some(to) = weight.recover_step(config.recover_rate) {
            tracing::debug!(
                dimension = %detail.dimension,
                healthy_windows = state.healthy_windows,
                weight.to = to,
                "dimension partially recovered"
            );
        }
        Ok(())
    }

    fn forget_removed(&self, states: &mut ahash::HashMap<InvocationDimension, DimensionState>) {
        states.retain(|dimension, state| {
            if self.registry.get(dimension).is_some() {
                return true;
            }
            if state.degraded
                && let Some(weight) = self.weights.get(dimension)
            {
                weight.restore(WarmupRamp::Immediate, Duration::ZERO);
            }
            tracing::debug!(
                dimension = %dimension,
                "regulation state dropped: dimension removed"
            );
            false
        });
    }

    fn notify(&self, result: &MeasureResult) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_regulated(result))) {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::warn!(
                    model = %result.key,
                    "regulation listener failed: {err}"
                ),
                Err(_) => tracing::error!(model = %result.key, "regulation listener panicked"),
            }
        }
    }

    /// Regulate once per configured time window until `guard` is cancelled.
    ///
    /// The first pass runs one window after the start.
    pub async fn run(self: Arc<Self>, guard: ShutdownGuard) {
        let window = self.configs.load().time_window;
        let mut interval = tokio::time::interval_at(Instant::now() + window, window);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cancelled = pin!(guard.cancelled());
        tracing::debug!(
            window.ms = duration_as_millis_u64(window),
            "regulation loop started"
        );
        loop {
            tokio::select! {
                _ = cancelled.as_mut() => {
                    tracing::debug!("regulation loop stopped: shutdown requested");
                    return;
                }
                _ = interval.tick() => {
                    let results = self.regulate();
                    tracing::trace!(models = results.len(), "regulation pass done");
                }
            }
        }
    }

    /// Spawn [`Regulator::run`] as a task tracked by `guard`.
    pub fn spawn(self: Arc<Self>, guard: ShutdownGuard) -> tokio::task::JoinHandle<()> {
        guard.clone().into_spawn_task(self.run(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultToleranceConfigs, Outcome, WeightStatus};
    use bulwark_utils::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    struct Setup {
        registry: Arc<InvocationStatRegistry>,
        weights: Arc<EndpointWeights>,
        regulator: Regulator,
    }

    fn setup(config: FaultToleranceConfig) -> Setup {
        let registry = Arc::new(InvocationStatRegistry::new());
        let models = Arc::new(MeasureModels::new());
        registry.add_listener(models.clone());
        let weights = Arc::new(EndpointWeights::new(ManualClock::new(0)));
        let configs =
            LiveConfigs::new(FaultToleranceConfigs::default().with_app("shop", config)).unwrap();
        let regulator = Regulator::new(registry.clone(), models, weights.clone(), configs);
        Setup {
            registry,
            weights,
            regulator,
        }
    }

    fn dim(endpoint: &str) -> InvocationDimension {
        InvocationDimension::new(endpoint, "shop", "OrderService")
    }

    impl Setup {
        fn window(&self, counts: &[(&str, u64, u64)]) {
            for &(endpoint, total, abnormal) in counts {
                let stat = self.registry.get_or_create(&dim(endpoint));
                for n in 0..total {
                    stat.record(if n < abnormal {
                        Outcome::Abnormal
                    } else {
                        Outcome::Success
                    });
                }
            }
        }
    }

    fn enabled() -> FaultToleranceConfig {
        FaultToleranceConfig::default().with_regulation_effective(true)
    }

    #[test]
    fn disabled_application_is_not_measured() {
        let setup = setup(FaultToleranceConfig::default());
        setup.window(&[("a", 100, 5), ("b", 100, 90)]);
        assert!(setup.regulator.regulate().is_empty());
        assert_eq!(setup.registry.get(&dim("a")).unwrap().invoke_count(), 100);
    }

    #[test]
    fn degrade_then_stepped_recovery() {
        let setup = setup(enabled().with_recover_cycles(3).with_recover_rate(2.0));
        for endpoint in ["a", "b", "c"] {
            setup.weights.register(dim(endpoint), 100);
        }

        setup.window(&[("a", 100, 5), ("b", 100, 5), ("c", 100, 90)]);
        setup.regulator.regulate();
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(5));
        assert_eq!(setup.regulator.degraded(), vec![dim("c")]);

        let healthy = [("a", 100, 5), ("b", 100, 5), ("c", 100, 5)];
        setup.window(&healthy);
        setup.regulator.regulate();
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(10));

        setup.window(&healthy);
        setup.regulator.regulate();
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(20));

        setup.window(&healthy);
        let results = setup.regulator.regulate();
        let detail = results[0].detail(&dim("c")).unwrap();
        assert_eq!(detail.state, MeasureState::Recovered);
        assert!(detail.recovered_origin_weight);
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(100));
        assert!(setup.regulator.degraded().is_empty());
    }

    #[test]
    fn abnormal_window_resets_recovery() {
        let setup = setup(enabled().with_recover_cycles(2));
        for endpoint in ["a", "b", "c"] {
            setup.weights.register(dim(endpoint), 100);
        }
        let bad = [("a", 100, 5), ("b", 100, 5), ("c", 100, 90)];
        let healthy = [("a", 100, 5), ("b", 100, 5), ("c", 100, 5)];

        setup.window(&bad);
        setup.regulator.regulate();
        setup.window(&healthy);
        setup.regulator.regulate();
        setup.window(&bad);
        setup.regulator.regulate();
        setup.window(&healthy);
        setup.regulator.regulate();

        assert_eq!(setup.regulator.degraded(), vec![dim("c")]);
        assert_eq!(
            setup.weights.get(&dim("c")).unwrap().status(),
            WeightStatus::Degraded
        );
    }

    #[test]
    fn log_only_when_degrading_is_off() {
        let setup = setup(enabled().with_degrade_effective(false));
        for endpoint in ["a", "b", "c"] {
            setup.weights.register(dim(endpoint), 100);
        }
        setup.window(&[("a", 100, 5), ("b", 100, 5), ("c", 100, 90)]);

        let results = setup.regulator.regulate();
        let detail = results[0].detail(&dim("c")).unwrap();
        assert_eq!(detail.state, MeasureState::Degrade);
        assert!(detail.log_only);
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(100));
    }

    #[test]
    fn degraded_endpoints_per_app_are_capped() {
        let setup = setup(
            enabled()
                .with_degrade_max_endpoints(1)
                .with_least_abnormal_rate_multiple(2.0),
        );
        for endpoint in ["a", "b", "c", "d", "e"] {
            setup.weights.register(dim(endpoint), 100);
        }
        setup.window(&[
            ("a", 100, 1),
            ("b", 100, 1),
            ("c", 100, 1),
            ("d", 100, 90),
            ("e", 100, 90),
        ]);

        let results = setup.regulator.regulate();
        assert_eq!(setup.regulator.degraded(), vec![dim("d")]);
        assert!(results[0].detail(&dim("e")).unwrap().log_only);
        assert_eq!(setup.weights.effective_weight(&dim("e")), Some(100));
    }

    #[test]
    fn removed_dimension_gets_its_weight_back() {
        let setup = setup(enabled());
        for endpoint in ["a", "b", "c"] {
            setup.weights.register(dim(endpoint), 100);
        }
        setup.window(&[("a", 100, 5), ("b", 100, 5), ("c", 100, 90)]);
        setup.regulator.regulate();
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(5));

        setup.registry.remove(&dim("c"));
        setup.regulator.regulate();
        assert!(setup.regulator.degraded().is_empty());
        assert_eq!(setup.weights.effective_weight(&dim("c")), Some(100));
    }

    #[test]
    #[traced_test]
    fn failure_on_one_dimension_does_not_stop_the_others() {
        let setup = setup(enabled().with_least_abnormal_rate_multiple(2.0));
        // "d" has no weight registered
        for endpoint in ["a", "b", "c", "e"] {
            setup.weights.register(dim(endpoint), 100);
        }
        setup.window(&[
            ("a", 100, 1),
            ("b", 100, 1),
            ("c", 100, 1),
            ("d", 100, 90),
            ("e", 100, 90),
        ]);

        let results = setup.regulator.regulate();
        assert_eq!(results.len(), 1);
        assert_eq!(setup.regulator.degraded(), vec![dim("e")]);
        assert_eq!(setup.weights.effective_weight(&dim("e")), Some(5));
        assert!(logs_contain("failed to regulate dimension"));
        assert!(logs_contain("no routing weight registered"));
    }

    struct Counting(AtomicUsize);

    impl RegulationListener for Counting {
        fn on_regulated(&self, _result: &MeasureResult) -> Result<(), BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panicking;

    impl RegulationListener for Panicking {
        fn on_regulated(&self, _result: &MeasureResult) -> Result<(), BoxError> {
            panic!("listener bug")
        }
    }

    #[test]
    #[traced_test]
    fn listeners_see_every_result_and_are_isolated() {
        let setup = setup(enabled());
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        setup.regulator.add_listener(Arc::new(Panicking));
        setup.regulator.add_listener(counting.clone());

        setup.window(&[("a", 100, 5), ("b", 100, 5)]);
        setup.regulator.regulate();
        setup.regulator.regulate();

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
        assert!(logs_contain("regulation listener panicked"));
    }
}
