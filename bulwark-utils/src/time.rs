//! time utilities.
//!
//! Weight ramps and regulation windows only ever need a monotonic millisecond
//! reading, so they depend on the [`Clock`] trait instead of reading
//! [`Instant`] directly. [`MonotonicClock`] is the production clock,
//! [`ManualClock`] can be moved by hand in tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic milliseconds.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// Milliseconds elapsed since an arbitrary but fixed origin.
    ///
    /// Never decreases between two calls on the same clock.
    fn now_millis(&self) -> u64;
}

impl<C: Clock> Clock for Arc<C> {
    #[inline]
    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }
}

/// [`Clock`] backed by [`Instant`], with the origin at the first read in this process.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Create a new [`MonotonicClock`].
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        let origin = ORIGIN.get_or_init(Instant::now);
        duration_as_millis_u64(origin.elapsed())
    }
}

/// [`Clock`] that only moves when told to.
///
/// Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Create a new [`ManualClock`] starting at the given millisecond reading.
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_millis)))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.0
            .fetch_add(duration_as_millis_u64(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Converts a Duration to milliseconds as u64 with saturation.
#[must_use]
pub fn duration_as_millis_u64(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Returns the current unix timestamp in milliseconds.
///
/// This reads the system clock each call.
/// The value is negative only if the system clock is before the unix epoch.
#[must_use]
pub fn unix_timestamp_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// (De)serialize a [`Duration`] as a plain number of milliseconds.
///
/// Use it as `#[serde(with = "bulwark_utils::time::serde_millis")]`.
pub mod serde_millis {
    use super::duration_as_millis_u64;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a [`Duration`] as milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration_as_millis_u64(*duration))
    }

    /// Deserialize a [`Duration`] from milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
