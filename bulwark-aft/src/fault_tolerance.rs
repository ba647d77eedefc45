use crate::{
    EndpointWeight, EndpointWeights, FaultToleranceConfigs, InvalidFaultToleranceConfig,
    InvocationDimension, InvocationStatRegistry, LiveConfigs, MeasureModels, MeasureResult,
    Outcome, RegulationListener, Regulator, WarmupRamp,
};
use bulwark_utils::time::{Clock, MonotonicClock};
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful::ShutdownGuard;

/// Entry point of adaptive fault tolerance.
///
/// Wires an [`InvocationStatRegistry`], the [`MeasureModels`] derived from it,
/// the [`EndpointWeights`] read by load balancers and the [`Regulator`]
/// that ties them together.
///
/// Callers [`record`] the outcome of every invocation, load balancers
/// read [`effective_weight`], and the regulator moves weights once per window,
/// either driven by [`spawn_regulator`] or by calling [`regulate`] directly.
///
/// [`record`]: FaultTolerance::record
/// [`effective_weight`]: FaultTolerance::effective_weight
/// [`spawn_regulator`]: FaultTolerance::spawn_regulator
/// [`regulate`]: FaultTolerance::regulate
#[derive(Debug, Clone)]
pub struct FaultTolerance {
    configs: LiveConfigs,
    registry: Arc<InvocationStatRegistry>,
    models: Arc<MeasureModels>,
    weights: Arc<EndpointWeights>,
    regulator: Arc<Regulator>,
}

impl FaultTolerance {
    /// Create a new [`FaultTolerance`] on the monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns an error if `configs` does not validate.
    pub fn new(configs: FaultToleranceConfigs) -> Result<Self, InvalidFaultToleranceConfig> {
        Self::with_clock(configs, MonotonicClock::new())
    }

    /// Create a new [`FaultTolerance`] whose weight warm-ups follow `clock`.
    ///
    /// # Errors
    ///
    /// Returns an error if `configs` does not validate.
    pub fn with_clock(
        configs: FaultToleranceConfigs,
        clock: impl Clock,
    ) -> Result<Self, InvalidFaultToleranceConfig> {
        let configs = LiveConfigs::new(configs)?;
        let registry = Arc::new(InvocationStatRegistry::new());
        let models = Arc::new(MeasureModels::new());
        registry.add_listener(models.clone());
        let weights = Arc::new(EndpointWeights::new(clock));
        let regulator = Arc::new(Regulator::new(
            registry.clone(),
            models.clone(),
            weights.clone(),
            configs.clone(),
        ));
        Ok(Self {
            configs,
            registry,
            models,
            weights,
            regulator,
        })
    }

    /// Record the outcome of one invocation.
    ///
    /// Returns `false`, and records nothing, when regulation is not in effect
    /// for the consuming application.
    pub fn record(&self, dimension: &InvocationDimension, outcome: Outcome) -> bool {
        if !self.configs.is_enabled(dimension.app()) {
            return false;
        }
        self.registry.get_or_create(dimension).record(outcome);
        true
    }

    /// Make an endpoint known to regulation with the weight its provider advertises.
    pub fn register_endpoint(
        &self,
        dimension: InvocationDimension,
        weight: u32,
    ) -> Arc<EndpointWeight> {
        self.weights.register(dimension, weight)
    }

    /// Like [`register_endpoint`](Self::register_endpoint), but start at `initial`
    /// and warm up to `weight` over `duration`.
    pub fn register_endpoint_with_warmup(
        &self,
        dimension: InvocationDimension,
        weight: u32,
        initial: u32,
        ramp: WarmupRamp,
        duration: Duration,
    ) -> Arc<EndpointWeight> {
        let endpoint = self.weights.register(dimension, weight);
        endpoint.start_warmup(initial, ramp, duration);
        endpoint
    }

    /// Forget an endpoint: its statistics, its weight and any regulation state.
    pub fn unregister_endpoint(&self, dimension: &InvocationDimension) {
        self.registry.remove(dimension);
        self.weights.unregister(dimension);
    }

    /// Weight the load balancer should use for an endpoint,
    /// `None` when it was never registered.
    #[must_use]
    pub fn effective_weight(&self, dimension: &InvocationDimension) -> Option<u32> {
        self.weights.effective_weight(dimension)
    }

    /// Run one regulation pass now.
    pub fn regulate(&self) -> Vec<MeasureResult> {
        self.regulator.regulate()
    }

    /// Observe the results of every regulation pass.
    pub fn add_regulation_listener(&self, listener: Arc<dyn RegulationListener>) {
        self.regulator.add_listener(listener);
    }

    /// Regulate once per time window until `guard` is cancelled.
    pub fn spawn_regulator(&self, guard: ShutdownGuard) -> tokio::task::JoinHandle<()> {
        self.regulator.clone().spawn(guard)
    }

    /// Replace the configuration in use.
    ///
    /// # Errors
    ///
    /// Returns an error, and keeps the current configuration, if `configs` is invalid.
    pub fn update_configs(
        &self,
        configs: FaultToleranceConfigs,
    ) -> Result<(), InvalidFaultToleranceConfig> {
        self.configs.store(configs)
    }

    /// The live configuration handle.
    #[must_use]
    pub fn configs(&self) -> &LiveConfigs {
        &self.configs
    }

    /// The invocation statistics.
    #[must_use]
    pub fn registry(&self) -> &Arc<InvocationStatRegistry> {
        &self.registry
    }

    /// The measure models.
    #[must_use]
    pub fn models(&self) -> &Arc<MeasureModels> {
        &self.models
    }

    /// The endpoint weights.
    #[must_use]
    pub fn weights(&self) -> &Arc<EndpointWeights> {
        &self.weights
    }

    /// The regulator.
    #[must_use]
    pub fn regulator(&self) -> &Arc<Regulator> {
        &self.regulator
    }

    /// Drop all statistics, models and weights.
    ///
    /// Listeners added to the registry are dropped as well.
    /// Recording afterwards starts from scratch: endpoints have to be
    /// registered again, and the models follow the registry as before.
    pub fn destroy(&self) {
        self.registry.destroy();
        self.models.clear();
        self.registry.add_listener(self.models.clone());
        self.weights.clear();
        tracing::debug!("fault tolerance destroyed");
    }
}
