//! Horizontal measurement: every endpoint of a service is compared with its peers.
//!
//! An endpoint is considered abnormal when, within one window, it saw enough
//! invocations to be judged and its abnormal rate exceeds the average abnormal
//! rate of its (judgeable) peers by the configured multiple.

use crate::registry::InvocationStatListener;
use crate::{FaultToleranceConfig, InvocationDimension, InvocationStat, ModelKey};
use bulwark_error::BoxError;
use bulwark_utils::time::{duration_as_millis_u64, unix_timestamp_millis};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// The stats of all endpoints serving one service to one application.
#[derive(Debug)]
pub struct MeasureModel {
    key: ModelKey,
    members: RwLock<ahash::HashMap<InvocationDimension, Arc<InvocationStat>>>,
}

impl MeasureModel {
    /// Create an empty model.
    #[must_use]
    pub fn new(key: ModelKey) -> Self {
        Self {
            key,
            members: RwLock::default(),
        }
    }

    /// The application and service this model compares endpoints of.
    #[must_use]
    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    /// Add a stat, returns `false` if its dimension was already a member.
    pub fn add(&self, stat: Arc<InvocationStat>) -> bool {
        let mut members = self.members.write();
        if members.contains_key(stat.dimension()) {
            return false;
        }
        members.insert(stat.dimension().clone(), stat);
        true
    }

    /// Remove a member, returns `false` if it was not a member.
    pub fn remove(&self, dimension: &InvocationDimension) -> bool {
        self.members.write().remove(dimension).is_some()
    }

    /// Returns `true` if `dimension` is a member.
    #[must_use]
    pub fn contains(&self, dimension: &InvocationDimension) -> bool {
        self.members.read().contains_key(dimension)
    }

    /// Amount of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Returns `true` if the model has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// The member stats, sorted by dimension.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<InvocationStat>> {
        let mut members: Vec<_> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.dimension().cmp(b.dimension()));
        members
    }
}

/// Index of [`MeasureModel`]s, kept in sync with an
/// [`InvocationStatRegistry`] by listening to it.
///
/// A model exists exactly as long as it has members.
///
/// [`InvocationStatRegistry`]: crate::InvocationStatRegistry
#[derive(Debug, Default)]
pub struct MeasureModels {
    models: RwLock<ahash::HashMap<ModelKey, Arc<MeasureModel>>>,
}

impl MeasureModels {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a model.
    #[must_use]
    pub fn get(&self, key: &ModelKey) -> Option<Arc<MeasureModel>> {
        self.models.read().get(key).cloned()
    }

    /// All models, sorted by key.
    #[must_use]
    pub fn models(&self) -> Vec<Arc<MeasureModel>> {
        let mut models: Vec<_> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.key().cmp(b.key()));
        models
    }

    /// Amount of models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    /// Returns `true` if there are no models.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.models.write().clear();
    }
}

impl InvocationStatListener for MeasureModels {
    fn on_added(&self, stat: &Arc<InvocationStat>) -> Result<(), BoxError> {
        let key = stat.dimension().model_key();
        let mut models = self.models.write();
        let model = models
            .entry(key)
            .or_insert_with_key(|key| Arc::new(MeasureModel::new(key.clone())));
        if model.add(stat.clone()) {
            tracing::trace!(
                model = %model.key(),
                dimension = %stat.dimension(),
                "measure model member added"
            );
        }
        Ok(())
    }

    fn on_removed(&self, stat: &Arc<InvocationStat>) -> Result<(), BoxError> {
        let key = stat.dimension().model_key();
        let mut models = self.models.write();
        let Some(model) = models.get(&key) else {
            return Ok(());
        };
        model.remove(stat.dimension());
        if model.is_empty() {
            models.remove(&key);
            tracing::debug!(model = %key, "measure model dropped: no members left");
        }
        Ok(())
    }
}

/// Verdict of one measurement for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureState {
    /// Within the tolerated range.
    Normal,
    /// Abnormal rate too far above the peer average.
    Degrade,
    /// Back to the original weight after enough healthy windows,
    /// set by the regulator.
    Recovered,
    /// Too few invocations to be judged.
    LogOnly,
}

/// Measurement of one dimension in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureResultDetail {
    /// The measured dimension.
    pub dimension: InvocationDimension,
    /// Verdict.
    pub state: MeasureState,
    /// Length of the window, in milliseconds.
    pub window_ms: u64,
    /// Invocations in the window.
    pub window_count: u64,
    /// Abnormal invocations in the window.
    pub abnormal_count: u64,
    /// Minimal invocations needed to be judged.
    pub least_window_count: u64,
    /// Abnormal rate in the window.
    pub abnormal_rate: f64,
    /// Average abnormal rate of the judgeable peers.
    pub average_abnormal_rate: f64,
    /// Multiple of the average that had to be exceeded.
    pub least_abnormal_rate_multiple: f64,
    /// The original weight was restored as a result of this measurement.
    pub recovered_origin_weight: bool,
    /// The verdict was not applied to the weight,
    /// either for lack of samples or because regulation held it back.
    pub log_only: bool,
}

/// Measurement of all members of one [`MeasureModel`] in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureResult {
    /// The measured model.
    pub key: ModelKey,
    /// Unix time of the measurement, in milliseconds.
    pub measured_at_unix_ms: i64,
    /// One entry per member.
    pub details: Vec<MeasureResultDetail>,
}

impl MeasureResult {
    /// The detail of one dimension.
    #[must_use]
    pub fn detail(&self, dimension: &InvocationDimension) -> Option<&MeasureResultDetail> {
        self.details.iter().find(|d| &d.dimension == dimension)
    }
}

/// Measure all members of `model` and close their window.
///
/// The average a member is compared with excludes the member itself
/// and every peer with fewer than `least_window_count` invocations.
/// Without judgeable peers, or with a peer average at or below
/// the noise floor, no member is found abnormal. This includes
/// a failing member among peers without any abnormal invocation
/// when the floor is left at its default of `0.0`.
#[must_use]
pub fn measure(
    model: &MeasureModel,
    config: &FaultToleranceConfig,
    window: Duration,
) -> MeasureResult {
    let members = model.members();
    let snapshots: Vec<_> = members.iter().map(|stat| stat.snapshot()).collect();
    let judgeable: Vec<bool> = snapshots
        .iter()
        .map(|snapshot| snapshot.total >= config.least_window_count)
        .collect();
    let rates: Vec<f64> = snapshots.iter().map(|s| s.abnormal_rate()).collect();

    let details = snapshots
        .iter()
        .enumerate()
        .map(|(index, snapshot)| {
            let (sum, peers) = rates
                .iter()
                .zip(&judgeable)
                .enumerate()
                .filter(|&(peer, (_, &counted))| peer != index && counted)
                .fold((0.0, 0_u32), |(sum, n), (_, (rate, _))| (sum + rate, n + 1));
            let average = if peers == 0 {
                0.0
            } else {
                sum / f64::from(peers)
            };
            let rate = rates[index];

            let state = if !judgeable[index] {
                MeasureState::LogOnly
            } else if average > config.abnormal_rate_noise_floor
                && rate > average * config.least_abnormal_rate_multiple
            {
                MeasureState::Degrade
            } else {
                MeasureState::Normal
            };

            MeasureResultDetail {
                dimension: snapshot.dimension.clone(),
                state,
                window_ms: duration_as_millis_u64(window),
                window_count: snapshot.total,
                abnormal_count: snapshot.abnormal,
                least_window_count: config.least_window_count,
                abnormal_rate: rate,
                average_abnormal_rate: average,
                least_abnormal_rate_multiple: config.least_abnormal_rate_multiple,
                recovered_origin_weight: false,
                log_only: state == MeasureState::LogOnly,
            }
        })
        .collect();

    for (stat, snapshot) in members.iter().zip(&snapshots) {
        stat.roll(snapshot);
    }

    MeasureResult {
        key: model.key().clone(),
        measured_at_unix_ms: unix_timestamp_millis(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;

    fn model_with(counts: &[(&str, u64, u64)]) -> MeasureModel {
        let model = MeasureModel::new(ModelKey::new("shop", "OrderService"));
        for &(endpoint, total, abnormal) in counts {
            let stat = Arc::new(InvocationStat::new(InvocationDimension::new(
                endpoint,
                "shop",
                "OrderService",
            )));
            for n in 0..total {
                stat.record(if n < abnormal {
                    Outcome::Abnormal
                } else {
                    Outcome::Success
                });
            }
            model.add(stat);
        }
        model
    }

    fn state_of(result: &MeasureResult, endpoint: &str) -> MeasureState {
        result
            .detail(&InvocationDimension::new(endpoint, "shop", "OrderService"))
            .unwrap()
            .state
    }

    fn config() -> FaultToleranceConfig {
        FaultToleranceConfig::default().with_regulation_effective(true)
    }

    #[test]
    fn outlier_is_degraded() {
        let model = model_with(&[("a", 100, 5), ("b", 100, 5), ("c", 100, 90)]);
        let result = measure(&model, &config(), Duration::from_secs(10));

        assert_eq!(state_of(&result, "a"), MeasureState::Normal);
        assert_eq!(state_of(&result, "b"), MeasureState::Normal);
        assert_eq!(state_of(&result, "c"), MeasureState::Degrade);

        let detail = result
            .detail(&InvocationDimension::new("c", "shop", "OrderService"))
            .unwrap();
        assert_eq!(detail.window_count, 100);
        assert_eq!(detail.window_ms, 10_000);
        assert!((detail.average_abnormal_rate - 0.05).abs() < 1e-9);
        assert!(!detail.log_only);
    }

    #[test]
    fn too_few_samples_is_log_only_and_not_a_peer() {
        // "c" would drag the average up if it were counted as a peer
        let model = model_with(&[("a", 100, 1), ("b", 100, 20), ("c", 5, 5)]);
        let result = measure(&model, &config(), Duration::from_secs(10));

        assert_eq!(state_of(&result, "c"), MeasureState::LogOnly);
        assert_eq!(state_of(&result, "b"), MeasureState::Degrade);
        assert!(
            result
                .detail(&InvocationDimension::new("c", "shop", "OrderService"))
                .unwrap()
                .log_only
        );
    }

    #[test]
    fn outlier_among_clean_peers_is_not_judged() {
        let model = model_with(&[("a", 100, 0), ("b", 100, 0), ("c", 100, 90)]);
        let result = measure(&model, &config(), Duration::from_secs(10));
        assert_eq!(state_of(&result, "c"), MeasureState::Normal);
    }

    #[test]
    fn one_abnormal_peer_invocation_lifts_the_default_floor() {
        let model = model_with(&[("a", 100, 1), ("b", 100, 0), ("c", 100, 90)]);
        let result = measure(&model, &config(), Duration::from_secs(10));
        assert_eq!(state_of(&result, "c"), MeasureState::Degrade);
        assert_eq!(state_of(&result, "a"), MeasureState::Normal);
    }

    #[test]
    fn single_member_is_normal() {
        let model = model_with(&[("a", 100, 100)]);
        let result = measure(&model, &config(), Duration::from_secs(10));
        assert_eq!(state_of(&result, "a"), MeasureState::Normal);
    }

    #[test]
    fn noise_floor_suppresses_degrade() {
        let model = model_with(&[("a", 100, 1), ("b", 100, 1), ("c", 100, 50)]);
        let result = measure(
            &model,
            &config().with_abnormal_rate_noise_floor(0.05),
            Duration::from_secs(10),
        );
        assert_eq!(state_of(&result, "c"), MeasureState::Normal);
    }

    #[test]
    fn measuring_rolls_the_window() {
        let model = model_with(&[("a", 100, 5), ("b", 100, 90)]);
        let result = measure(&model, &config(), Duration::from_secs(10));
        assert_eq!(result.details.len(), 2);
        for stat in model.members() {
            assert_eq!(stat.invoke_count(), 0);
            assert_eq!(stat.abnormal_count(), 0);
        }
    }

    #[test]
    fn models_follow_registry_events() {
        let models = MeasureModels::new();
        let stat = Arc::new(InvocationStat::new(InvocationDimension::new(
            "a",
            "shop",
            "OrderService",
        )));
        models.on_added(&stat).unwrap();
        models.on_added(&stat).unwrap();

        let key = ModelKey::new("shop", "OrderService");
        assert_eq!(models.get(&key).unwrap().len(), 1);

        models.on_removed(&stat).unwrap();
        assert!(models.get(&key).is_none());
        assert!(models.is_empty());
    }
}
