//! Windowed invocation counters.

use crate::InvocationDimension;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of a single invocation, as far as fault tolerance is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The provider answered.
    Success,
    /// The provider failed to answer: a timeout or a transport/server error.
    ///
    /// Business exceptions returned by a healthy provider are a [`Outcome::Success`].
    Abnormal,
}

impl Outcome {
    /// Classify a call result, any `Err` counts as abnormal.
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Abnormal,
        }
    }

    /// Returns `true` if this is an [`Outcome::Abnormal`].
    #[must_use]
    pub fn is_abnormal(self) -> bool {
        matches!(self, Self::Abnormal)
    }
}

/// Invocation and abnormal counters of one [`InvocationDimension`]
/// for the current time window.
///
/// Recording is lock-free, many request threads can record concurrently
/// while the regulator takes a [`snapshot`] and [`roll`]s the window.
///
/// [`snapshot`]: InvocationStat::snapshot
/// [`roll`]: InvocationStat::roll
#[derive(Debug)]
pub struct InvocationStat {
    dimension: InvocationDimension,
    total: AtomicU64,
    abnormal: AtomicU64,
}

impl InvocationStat {
    /// Create an empty [`InvocationStat`].
    #[must_use]
    pub fn new(dimension: InvocationDimension) -> Self {
        Self {
            dimension,
            total: AtomicU64::new(0),
            abnormal: AtomicU64::new(0),
        }
    }

    /// The dimension these counters belong to.
    #[must_use]
    pub fn dimension(&self) -> &InvocationDimension {
        &self.dimension
    }

    /// Count one invocation.
    pub fn record(&self, outcome: Outcome) {
        // total before abnormal: a concurrent snapshot never sees abnormal > total
        self.total.fetch_add(1, Ordering::AcqRel);
        if outcome.is_abnormal() {
            self.abnormal.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Invocations counted in the current window.
    #[must_use]
    pub fn invoke_count(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Abnormal invocations counted in the current window.
    #[must_use]
    pub fn abnormal_count(&self) -> u64 {
        self.abnormal.load(Ordering::Acquire)
    }

    /// Abnormal rate of the current window, `0.0` when nothing was counted.
    #[must_use]
    pub fn abnormal_rate(&self) -> f64 {
        self.snapshot().abnormal_rate()
    }

    /// Consistent copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> InvocationStatSnapshot {
        let abnormal = self.abnormal.load(Ordering::Acquire);
        let total = self.total.load(Ordering::Acquire);
        InvocationStatSnapshot {
            dimension: self.dimension.clone(),
            total,
            abnormal: abnormal.min(total),
        }
    }

    /// Close the window that `snapshot` was taken of.
    ///
    /// Invocations recorded after the snapshot was taken are kept
    /// and count towards the next window.
    pub fn roll(&self, snapshot: &InvocationStatSnapshot) {
        saturating_sub(&self.total, snapshot.total);
        saturating_sub(&self.abnormal, snapshot.abnormal);
    }

    /// Add counters collected elsewhere, e.g. by another process.
    pub fn merge(&self, snapshot: &InvocationStatSnapshot) {
        self.total.fetch_add(snapshot.total, Ordering::AcqRel);
        self.abnormal
            .fetch_add(snapshot.abnormal.min(snapshot.total), Ordering::AcqRel);
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(n))
        })
        .unwrap_or_else(|current| current);
}

/// Point-in-time copy of an [`InvocationStat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationStatSnapshot {
    /// The dimension the counters belong to.
    pub dimension: InvocationDimension,
    /// Invocations counted.
    pub total: u64,
    /// Abnormal invocations counted.
    pub abnormal: u64,
}

impl InvocationStatSnapshot {
    /// Abnormal rate, `0.0` when nothing was counted.
    #[must_use]
    pub fn abnormal_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.abnormal as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::Arc;

    fn stat() -> InvocationStat {
        InvocationStat::new(InvocationDimension::new(
            "10.0.0.1:12200",
            "shop",
            "OrderService",
        ))
    }

    #[test]
    fn abnormal_rate_of_empty_window_is_zero() {
        assert_eq!(stat().abnormal_rate(), 0.0);
    }

    #[test]
    fn record_counts_outcomes() {
        let stat = stat();
        for _ in 0..3 {
            stat.record(Outcome::Success);
        }
        stat.record(Outcome::Abnormal);
        assert_eq!(stat.invoke_count(), 4);
        assert_eq!(stat.abnormal_count(), 1);
        assert_eq!(stat.abnormal_rate(), 0.25);
    }

    #[test]
    fn roll_keeps_invocations_recorded_after_the_snapshot() {
        let stat = stat();
        stat.record(Outcome::Abnormal);
        stat.record(Outcome::Success);
        let snapshot = stat.snapshot();

        stat.record(Outcome::Abnormal);
        stat.roll(&snapshot);

        assert_eq!(stat.invoke_count(), 1);
        assert_eq!(stat.abnormal_count(), 1);
    }

    #[test]
    fn outcome_from_result() {
        assert_eq!(Outcome::from_result(&Ok::<_, ()>(1)), Outcome::Success);
        assert_eq!(Outcome::from_result(&Err::<(), _>("timeout")), Outcome::Abnormal);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let stat = Arc::new(stat());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let stat = stat.clone();
                std::thread::spawn(move || {
                    for n in 0..1_000 {
                        let outcome = if (i + n) % 4 == 0 {
                            Outcome::Abnormal
                        } else {
                            Outcome::Success
                        };
                        stat.record(outcome);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(stat.invoke_count(), 8_000);
        assert_eq!(stat.abnormal_count(), 2_000);
    }

    #[quickcheck]
    fn rate_stays_within_bounds(outcomes: Vec<bool>) -> bool {
        let stat = stat();
        for abnormal in outcomes {
            stat.record(if abnormal {
                Outcome::Abnormal
            } else {
                Outcome::Success
            });
        }
        let rate = stat.abnormal_rate();
        (0.0..=1.0).contains(&rate)
    }
}
