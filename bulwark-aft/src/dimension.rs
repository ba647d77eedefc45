//! The key that invocation statistics are collected under.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// Identifies one consumer-to-provider channel:
/// calls made by the consumer `app` to `service` (optionally narrowed by a
/// `unique_id`) on the provider reachable at `endpoint`.
///
/// Equality and hashing take all four fields into account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationDimension {
    endpoint: SmolStr,
    app: SmolStr,
    #[serde(default)]
    unique_id: SmolStr,
    service: SmolStr,
}

impl InvocationDimension {
    /// Create a new [`InvocationDimension`] without a unique id.
    pub fn new(
        endpoint: impl Into<SmolStr>,
        app: impl Into<SmolStr>,
        service: impl Into<SmolStr>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            app: app.into(),
            unique_id: SmolStr::default(),
            service: service.into(),
        }
    }

    /// Narrow the dimension to one of several consumers of the same service.
    #[must_use]
    pub fn with_unique_id(mut self, unique_id: impl Into<SmolStr>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    /// Address of the provider.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Name of the consuming application.
    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Consumer unique id, empty when not set.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Name of the invoked service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Key of the measure model this dimension is compared within.
    #[must_use]
    pub fn model_key(&self) -> ModelKey {
        ModelKey {
            app: self.app.clone(),
            service: self.service.clone(),
        }
    }
}

impl fmt::Display for InvocationDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.app, self.service)?;
        if !self.unique_id.is_empty() {
            write!(f, ":{}", self.unique_id)?;
        }
        write!(f, "@{}", self.endpoint)
    }
}

/// Groups the dimensions that are measured against each other:
/// all endpoints serving the same service to the same application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    app: SmolStr,
    service: SmolStr,
}

impl ModelKey {
    /// Create a new [`ModelKey`].
    pub fn new(app: impl Into<SmolStr>, service: impl Into<SmolStr>) -> Self {
        Self {
            app: app.into(),
            service: service.into(),
        }
    }

    /// Name of the consuming application.
    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Name of the invoked service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.app, self.service)
    }
}
