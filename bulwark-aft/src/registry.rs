//! The process-wide collection of [`InvocationStat`]s.

use crate::{InvocationDimension, InvocationStat, InvocationStatSnapshot};
use bulwark_error::BoxError;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Observer of stats being added to or removed from an [`InvocationStatRegistry`].
///
/// Callbacks run while the registry is locked for writing:
/// they must not call back into the registry.
/// An error or panic of one listener is logged and does not affect
/// the registry or other listeners.
pub trait InvocationStatListener: Send + Sync + 'static {
    /// Called once, when the stat of a new dimension is created.
    fn on_added(&self, _stat: &Arc<InvocationStat>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once, when a stat is removed from the registry.
    fn on_removed(&self, _stat: &Arc<InvocationStat>) -> Result<(), BoxError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Added,
    Removed,
}

impl Event {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
        }
    }
}

/// Maps every [`InvocationDimension`] to its single [`InvocationStat`].
#[derive(Default)]
pub struct InvocationStatRegistry {
    stats: RwLock<ahash::HashMap<InvocationDimension, Arc<InvocationStat>>>,
    listeners: RwLock<Vec<Arc<dyn InvocationStatListener>>>,
}

impl fmt::Debug for InvocationStatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationStatRegistry")
            .field("stats", &self.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl InvocationStatRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the stat of a dimension.
    #[must_use]
    pub fn get(&self, dimension: &InvocationDimension) -> Option<Arc<InvocationStat>> {
        self.stats.read().get(dimension).cloned()
    }

    /// The stat of `dimension`, created and announced to the listeners
    /// if it did not exist yet.
    ///
    /// Concurrent callers for the same dimension all receive the same stat,
    /// and listeners are told about it exactly once.
    pub fn get_or_create(&self, dimension: &InvocationDimension) -> Arc<InvocationStat> {
        if let Some(stat) = self.get(dimension) {
            return stat;
        }

        let mut stats = self.stats.write();
        let stat = match stats.entry(dimension.clone()) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => entry
                .insert(Arc::new(InvocationStat::new(dimension.clone())))
                .clone(),
        };
        tracing::debug!(dimension = %dimension, "invocation stat added");
        self.notify(&stat, Event::Added);
        stat
    }

    /// Remove the stat of a dimension, e.g. because its provider went away.
    pub fn remove(&self, dimension: &InvocationDimension) -> Option<Arc<InvocationStat>> {
        let mut stats = self.stats.write();
        let stat = stats.remove(dimension)?;
        tracing::debug!(dimension = %dimension, "invocation stat removed");
        self.notify(&stat, Event::Removed);
        Some(stat)
    }

    /// Add counters collected elsewhere to the local stats.
    pub fn update_from_snapshots(
        &self,
        snapshots: impl IntoIterator<Item = InvocationStatSnapshot>,
    ) {
        for snapshot in snapshots {
            self.get_or_create(&snapshot.dimension).merge(&snapshot);
        }
    }

    /// All stats currently registered.
    #[must_use]
    pub fn stats(&self) -> Vec<Arc<InvocationStat>> {
        self.stats.read().values().cloned().collect()
    }

    /// Amount of registered stats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.read().len()
    }

    /// Returns `true` if no stats are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.read().is_empty()
    }

    /// Register a listener, it only hears about changes made from now on.
    pub fn add_listener(&self, listener: Arc<dyn InvocationStatListener>) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener previously passed to [`add_listener`](Self::add_listener).
    pub fn remove_listener(&self, listener: &Arc<dyn InvocationStatListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() != before
    }

    /// Drop all stats and listeners.
    ///
    /// Listeners are not notified about the dropped stats.
    pub fn destroy(&self) {
        let mut stats = self.stats.write();
        let dropped = stats.len();
        stats.clear();
        self.listeners.write().clear();
        tracing::debug!(stats = dropped, "invocation stat registry destroyed");
    }

    fn notify(&self, stat: &Arc<InvocationStat>, event: Event) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| match event {
                Event::Added => listener.on_added(stat),
                Event::Removed => listener.on_removed(stat),
            }));
            match result {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::warn!(
                    dimension = %stat.dimension(),
                    event = event.as_str(),
                    "invocation stat listener failed: {err}"
                ),
                Err(_) => tracing::error!(
                    dimension = %stat.dimension(),
                    event = event.as_str(),
                    "invocation stat listener panicked"
                ),
            }
        }
    }
}
