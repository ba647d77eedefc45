//! Routing weights as seen by the load balancer, and how regulation moves them.
//!
//! Every [`EndpointWeight`] has an original weight, as advertised by the provider,
//! and an effective weight, which is what the load balancer should use.
//! The two differ while an endpoint is degraded, or while it warms up
//! after a recovery or after it was first registered.

use crate::InvocationDimension;
use bulwark_utils::time::{Clock, MonotonicClock, duration_as_millis_u64};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How the weight of a degraded endpoint is lowered, applied once per degrade decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradeCurve {
    /// Multiply the weight with `rate`, expected in `(0, 1)`.
    Ratio {
        /// Multiplier applied to the current weight.
        rate: f64,
    },
    /// Subtract a fixed `step` from the weight.
    Step {
        /// Amount subtracted from the current weight.
        step: u32,
    },
}

impl Default for DegradeCurve {
    fn default() -> Self {
        Self::Ratio { rate: 0.05 }
    }
}

impl DegradeCurve {
    /// Apply the curve to `weight`, without any floor applied.
    #[must_use]
    pub fn apply(&self, weight: u32) -> u32 {
        match *self {
            Self::Ratio { rate } => scale(weight, rate.clamp(0.0, 1.0), f64::floor),
            Self::Step { step } => weight.saturating_sub(step),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        match *self {
            Self::Ratio { rate } if !(rate > 0.0 && rate < 1.0) => {
                Err("degrade ratio must be within (0, 1)")
            }
            Self::Step { step: 0 } => Err("degrade step must be non-zero"),
            _ => Ok(()),
        }
    }
}

/// Shape of a warm-up: how fast the effective weight climbs back
/// from its starting point to the original weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupRamp {
    /// Jump to the original weight right away.
    #[default]
    Immediate,
    /// Climb at a constant rate.
    Linear,
    /// Climb slowly at first and faster near the end.
    Quadratic,
}

impl WarmupRamp {
    /// Fraction of the warm-up completed after `elapsed`, within `[0, 1]`.
    ///
    /// Never decreases as `elapsed` grows.
    #[must_use]
    pub fn progress(self, elapsed: Duration, duration: Duration) -> f64 {
        if matches!(self, Self::Immediate) || elapsed >= duration || duration.is_zero() {
            return 1.0;
        }
        let t = (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0);
        match self {
            Self::Immediate => 1.0,
            Self::Linear => t,
            Self::Quadratic => t * t,
        }
    }
}

/// Regulation status of an [`EndpointWeight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightStatus {
    /// Effective weight equals the original weight.
    Normal,
    /// Lowered by regulation.
    Degraded,
    /// Climbing back towards the original weight.
    WarmingUp,
}

/// Weight of one provider endpoint as used by one consumer.
///
/// Reads and writes are atomic with respect to each other: the load balancer
/// never observes a half-applied degrade or recovery.
pub struct EndpointWeight {
    dimension: InvocationDimension,
    clock: Arc<dyn Clock>,
    state: RwLock<WeightState>,
}

#[derive(Debug, Clone, Copy)]
struct WeightState {
    original: u32,
    current: u32,
    status: WeightStatus,
    warmup: Option<Warmup>,
}

#[derive(Debug, Clone, Copy)]
struct Warmup {
    started_at_ms: u64,
    duration: Duration,
    ramp: WarmupRamp,
}

impl WeightState {
    fn effective_at(&self, now_ms: u64) -> u32 {
        match self.warmup {
            None => self.current,
            Some(warmup) => {
                let elapsed = Duration::from_millis(now_ms.saturating_sub(warmup.started_at_ms));
                let progress = warmup.ramp.progress(elapsed, warmup.duration);
                let gap = self.original.saturating_sub(self.current);
                self.current
                    .saturating_add(scale(gap, progress, f64::floor))
                    .min(self.original.max(self.current))
            }
        }
    }

    fn warmup_finished_at(&self, now_ms: u64) -> bool {
        self.warmup.is_some_and(|warmup| {
            now_ms.saturating_sub(warmup.started_at_ms) >= duration_as_millis_u64(warmup.duration)
        })
    }

    fn settle(&mut self) {
        self.current = self.original;
        self.status = WeightStatus::Normal;
        self.warmup = None;
    }
}

impl EndpointWeight {
    /// Create a new [`EndpointWeight`] at its original weight.
    pub fn new(dimension: InvocationDimension, original: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            dimension,
            clock,
            state: RwLock::new(WeightState {
                original,
                current: original,
                status: WeightStatus::Normal,
                warmup: None,
            }),
        }
    }

    /// The dimension this weight is used for.
    #[must_use]
    pub fn dimension(&self) -> &InvocationDimension {
        &self.dimension
    }

    /// Weight as advertised by the provider.
    #[must_use]
    pub fn original_weight(&self) -> u32 {
        self.state.read().original
    }

    /// Current regulation status.
    ///
    /// A finished warm-up reports [`WeightStatus::Normal`].
    #[must_use]
    pub fn status(&self) -> WeightStatus {
        let now = self.clock.now_millis();
        let state = self.state.read();
        if state.warmup_finished_at(now) {
            WeightStatus::Normal
        } else {
            state.status
        }
    }

    /// Weight the load balancer should use right now.
    ///
    /// Once a warm-up has run its course the warm-up bookkeeping is dropped
    /// and the original weight is returned from then on.
    #[must_use]
    pub fn effective_weight(&self) -> u32 {
        let now = self.clock.now_millis();
        {
            let state = self.state.read();
            if !state.warmup_finished_at(now) {
                return state.effective_at(now);
            }
        }
        let mut state = self.state.write();
        if state.warmup_finished_at(now) {
            state.settle();
        }
        state.effective_at(now)
    }

    /// Update the original weight, e.g. after the provider re-registered.
    ///
    /// An endpoint that is not regulated follows the new weight immediately.
    pub fn set_original_weight(&self, original: u32) {
        let mut state = self.state.write();
        state.original = original;
        if state.status == WeightStatus::Normal {
            state.current = original;
        } else {
            state.current = state.current.min(original);
        }
    }

    /// Lower the weight according to `curve`, never below `floor` and never below 1.
    ///
    /// Degrading cancels a running warm-up, starting from the weight reached so far.
    /// Returns the new weight, or `None` when the weight is already at its floor.
    pub fn degrade(&self, curve: DegradeCurve, floor: u32) -> Option<u32> {
        let now = self.clock.now_millis();
        let mut state = self.state.write();
        let base = state.effective_at(now);
        let target = curve.apply(base).max(floor).max(1);
        if target >= base {
            return None;
        }
        state.current = target;
        state.status = WeightStatus::Degraded;
        state.warmup = None;
        Some(target)
    }

    /// Partially recover a degraded weight by multiplying it with `rate`,
    /// capped at the original weight.
    ///
    /// Returns the new weight, or `None` when the endpoint is not degraded.
    pub fn recover_step(&self, rate: f64) -> Option<u32> {
        let mut state = self.state.write();
        if state.status != WeightStatus::Degraded {
            return None;
        }
        let stepped = scale(state.current, rate.max(1.0), f64::ceil)
            .max(state.current.saturating_add(1));
        state.current = stepped.min(state.original);
        Some(state.current)
    }

    /// Restore the original weight, through a warm-up when `duration` is non-zero.
    pub fn restore(&self, ramp: WarmupRamp, duration: Duration) {
        let now = self.clock.now_millis();
        let mut state = self.state.write();
        let from = state.effective_at(now);
        Self::begin_warmup(&mut state, from, ramp, duration, now);
    }

    /// Start with `initial` and warm up to the original weight,
    /// used for endpoints that just joined and have no history yet.
    pub fn start_warmup(&self, initial: u32, ramp: WarmupRamp, duration: Duration) {
        let now = self.clock.now_millis();
        let mut state = self.state.write();
        let from = initial.max(1);
        Self::begin_warmup(&mut state, from, ramp, duration, now);
    }

    fn begin_warmup(
        state: &mut WeightState,
        from: u32,
        ramp: WarmupRamp,
        duration: Duration,
        now_ms: u64,
    ) {
        if matches!(ramp, WarmupRamp::Immediate) || duration.is_zero() || from >= state.original {
            state.settle();
            return;
        }
        state.current = from;
        state.status = WeightStatus::WarmingUp;
        state.warmup = Some(Warmup {
            started_at_ms: now_ms,
            duration,
            ramp,
        });
    }

    /// Point-in-time view, for observability.
    #[must_use]
    pub fn snapshot(&self) -> EndpointWeightSnapshot {
        let now = self.clock.now_millis();
        let state = self.state.read();
        let finished = state.warmup_finished_at(now);
        EndpointWeightSnapshot {
            dimension: self.dimension.clone(),
            original: state.original,
            effective: state.effective_at(now),
            status: if finished {
                WeightStatus::Normal
            } else {
                state.status
            },
        }
    }
}

impl fmt::Debug for EndpointWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointWeight")
            .field("dimension", &self.dimension)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Point-in-time copy of an [`EndpointWeight`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointWeightSnapshot {
    /// The dimension the weight is used for.
    pub dimension: InvocationDimension,
    /// Weight as advertised by the provider.
    pub original: u32,
    /// Weight the load balancer uses.
    pub effective: u32,
    /// Regulation status.
    pub status: WeightStatus,
}

/// The weights of all endpoints known to the load balancers of this process.
pub struct EndpointWeights {
    clock: Arc<dyn Clock>,
    weights: RwLock<ahash::HashMap<InvocationDimension, Arc<EndpointWeight>>>,
}

impl Default for EndpointWeights {
    fn default() -> Self {
        Self::new(MonotonicClock::new())
    }
}

impl fmt::Debug for EndpointWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointWeights")
            .field("clock", &self.clock)
            .field("len", &self.len())
            .finish()
    }
}

impl EndpointWeights {
    /// Create an empty registry reading time from `clock`.
    pub fn new(clock: impl Clock) -> Self {
        Self {
            clock: Arc::new(clock),
            weights: RwLock::default(),
        }
    }

    /// Register the weight of an endpoint, or update its original weight
    /// when it is already known.
    pub fn register(&self, dimension: InvocationDimension, original: u32) -> Arc<EndpointWeight> {
        if let Some(weight) = self.get(&dimension) {
            weight.set_original_weight(original);
            return weight;
        }
        let mut weights = self.weights.write();
        let weight = weights.entry(dimension).or_insert_with_key(|dimension| {
            Arc::new(EndpointWeight::new(
                dimension.clone(),
                original,
                self.clock.clone(),
            ))
        });
        weight.set_original_weight(original);
        weight.clone()
    }

    /// Look up the weight of an endpoint.
    #[must_use]
    pub fn get(&self, dimension: &InvocationDimension) -> Option<Arc<EndpointWeight>> {
        self.weights.read().get(dimension).cloned()
    }

    /// Effective weight of an endpoint, `None` when it is not registered.
    #[must_use]
    pub fn effective_weight(&self, dimension: &InvocationDimension) -> Option<u32> {
        self.get(dimension).map(|weight| weight.effective_weight())
    }

    /// Forget an endpoint.
    pub fn unregister(&self, dimension: &InvocationDimension) -> Option<Arc<EndpointWeight>> {
        self.weights.write().remove(dimension)
    }

    /// Amount of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.read().len()
    }

    /// Returns `true` if no endpoints are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.read().is_empty()
    }

    /// Snapshots of all registered weights.
    #[must_use]
    pub fn snapshots(&self) -> Vec<EndpointWeightSnapshot> {
        self.weights
            .read()
            .values()
            .map(|weight| weight.snapshot())
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.weights.write().clear();
    }
}

// saturating: NaN and negatives map to zero, overflow to u32::MAX
fn scale(weight: u32, factor: f64, round: fn(f64) -> f64) -> u32 {
    let scaled = round(f64::from(weight) * factor);
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_utils::time::ManualClock;

    fn weight(original: u32) -> (EndpointWeight, ManualClock) {
        let clock = ManualClock::new(0);
        let weight = EndpointWeight::new(
            InvocationDimension::new("10.0.0.1:12200", "shop", "OrderService"),
            original,
            Arc::new(clock.clone()),
        );
        (weight, clock)
    }

    #[test]
    fn degrade_curves() {
        assert_eq!(DegradeCurve::Ratio { rate: 0.05 }.apply(100), 5);
        assert_eq!(DegradeCurve::Ratio { rate: 0.5 }.apply(3), 1);
        assert_eq!(DegradeCurve::Step { step: 30 }.apply(100), 70);
        assert_eq!(DegradeCurve::Step { step: 30 }.apply(10), 0);
    }

    #[test]
    fn degrade_curve_validation() {
        assert!(DegradeCurve::Ratio { rate: 1.0 }.validate().is_err());
        assert!(DegradeCurve::Ratio { rate: 0.0 }.validate().is_err());
        assert!(DegradeCurve::Ratio { rate: f64::NAN }.validate().is_err());
        assert!(DegradeCurve::Step { step: 0 }.validate().is_err());
        assert!(DegradeCurve::default().validate().is_ok());
    }

    #[test]
    fn degrade_never_goes_below_floor_or_zero() {
        let (weight, _) = weight(100);
        let curve = DegradeCurve::Ratio { rate: 0.05 };

        assert_eq!(weight.degrade(curve, 1), Some(5));
        assert_eq!(weight.degrade(curve, 1), Some(1));
        assert_eq!(weight.degrade(curve, 1), None);
        assert_eq!(weight.effective_weight(), 1);
        assert_eq!(weight.status(), WeightStatus::Degraded);

        let (weight, _) = self::weight(100);
        assert_eq!(weight.degrade(DegradeCurve::Step { step: 200 }, 0), Some(1));
    }

    #[test]
    fn degrade_is_refused_at_floor() {
        let (weight, _) = weight(10);
        assert_eq!(weight.degrade(DegradeCurve::default(), 10), None);
        assert_eq!(weight.status(), WeightStatus::Normal);
        assert_eq!(weight.effective_weight(), 10);
    }

    #[test]
    fn recover_step_is_capped_at_original() {
        let (weight, _) = weight(100);
        weight.degrade(DegradeCurve::default(), 1);
        assert_eq!(weight.recover_step(4.0), Some(20));
        assert_eq!(weight.recover_step(4.0), Some(80));
        assert_eq!(weight.recover_step(4.0), Some(100));
        assert_eq!(weight.original_weight(), 100);
    }

    #[test]
    fn recover_step_requires_degraded_weight() {
        let (weight, _) = weight(100);
        assert_eq!(weight.recover_step(2.0), None);
    }

    #[test]
    fn immediate_restore() {
        let (weight, _) = weight(100);
        weight.degrade(DegradeCurve::default(), 1);
        weight.restore(WarmupRamp::Immediate, Duration::from_secs(10));
        assert_eq!(weight.effective_weight(), 100);
        assert_eq!(weight.status(), WeightStatus::Normal);
    }

    #[test]
    fn linear_warmup_climbs_monotonically_and_settles() {
        let (weight, clock) = weight(100);
        weight.start_warmup(10, WarmupRamp::Linear, Duration::from_secs(10));
        assert_eq!(weight.effective_weight(), 10);
        assert_eq!(weight.status(), WeightStatus::WarmingUp);

        let mut last = weight.effective_weight();
        for _ in 0..9 {
            clock.advance(Duration::from_secs(1));
            let now = weight.effective_weight();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 91);

        clock.advance(Duration::from_secs(1));
        assert_eq!(weight.effective_weight(), 100);
        assert_eq!(weight.status(), WeightStatus::Normal);
    }

    #[test]
    fn degrade_during_warmup_starts_from_reached_weight() {
        let (weight, clock) = weight(100);
        weight.start_warmup(0, WarmupRamp::Linear, Duration::from_secs(10));
        clock.advance(Duration::from_secs(5));
        assert_eq!(weight.effective_weight(), 50);

        assert_eq!(weight.degrade(DegradeCurve::Ratio { rate: 0.5 }, 1), Some(25));
        clock.advance(Duration::from_secs(10));
        assert_eq!(weight.effective_weight(), 25);
    }

    #[test]
    fn quadratic_ramp_trails_linear() {
        let duration = Duration::from_secs(10);
        for secs in 1..10 {
            let elapsed = Duration::from_secs(secs);
            assert!(
                WarmupRamp::Quadratic.progress(elapsed, duration)
                    <= WarmupRamp::Linear.progress(elapsed, duration)
            );
        }
    }

    #[test]
    fn registry_updates_original_weight_on_re_register() {
        let weights = EndpointWeights::new(ManualClock::new(0));
        let dim = InvocationDimension::new("10.0.0.1:12200", "shop", "OrderService");
        let first = weights.register(dim.clone(), 100);
        let second = weights.register(dim.clone(), 50);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(weights.effective_weight(&dim), Some(50));

        weights.unregister(&dim);
        assert_eq!(weights.effective_weight(&dim), None);
        assert!(weights.is_empty());
    }
}
