//! Configuration of an [`ElasticPool`].
//!
//! [`ElasticPool`]: crate::ElasticPool

use bulwark_utils::time::serde_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sizing and timing of an [`ElasticPool`].
///
/// Durations are (de)serialized as milliseconds:
///
/// ```
/// use bulwark_pool::PoolConfig;
/// use std::time::Duration;
///
/// let config: PoolConfig = serde_json::from_str(r#"{
///     "core_workers": 2,
///     "max_workers": 8,
///     "retry_offer_timeout_ms": 50
/// }"#).unwrap();
///
/// assert_eq!(config.max_workers, 8);
/// assert_eq!(config.retry_offer_timeout, Duration::from_millis(50));
/// assert!(config.validate().is_ok());
/// ```
///
/// [`ElasticPool`]: crate::ElasticPool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Prefix of the worker thread names.
    pub name: String,
    /// Workers that are kept alive even when idle.
    pub core_workers: usize,
    /// Upper bound of live workers.
    pub max_workers: usize,
    /// Capacity of the admission queue, used once the pool is at its maximum.
    pub queue_capacity: usize,
    /// How long a worker above the core size may stay idle before it is reclaimed.
    #[serde(with = "serde_millis", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
    /// How long a submitter waits for queue capacity once pool and queue are saturated.
    #[serde(with = "serde_millis", rename = "retry_offer_timeout_ms")]
    pub retry_offer_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "bulwark-worker".to_owned(),
            core_workers: 20,
            max_workers: 200,
            queue_capacity: 256,
            idle_timeout: Duration::from_secs(60),
            retry_offer_timeout: Duration::from_millis(200),
        }
    }
}

impl PoolConfig {
    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the amount of core workers.
    #[must_use]
    pub fn with_core_workers(mut self, core_workers: usize) -> Self {
        self.core_workers = core_workers;
        self
    }

    /// Set the maximum amount of workers.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the admission queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the idle timeout of non-core workers.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the bounded wait used once pool and queue are saturated.
    #[must_use]
    pub fn with_retry_offer_timeout(mut self, timeout: Duration) -> Self {
        self.retry_offer_timeout = timeout;
        self
    }

    /// Validate the config.
    ///
    /// # Errors
    ///
    /// Returns a config validation error if:
    /// - `max_workers` is zero;
    /// - `core_workers` > `max_workers`;
    /// - `queue_capacity` is zero;
    /// - `idle_timeout` is zero.
    pub fn validate(&self) -> Result<(), InvalidPoolConfig> {
        if self.max_workers == 0 {
            return Err(InvalidPoolConfig("max workers must be non-zero"));
        }
        if self.core_workers > self.max_workers {
            return Err(InvalidPoolConfig(
                "core workers must not be greater than max workers",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(InvalidPoolConfig("queue capacity must be non-zero"));
        }
        if self.idle_timeout.is_zero() {
            return Err(InvalidPoolConfig("idle timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Pool config validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPoolConfig(&'static str);

impl fmt::Display for InvalidPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pool config: {}", self.0)
    }
}

impl std::error::Error for InvalidPoolConfig {}
