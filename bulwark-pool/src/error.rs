//! Errors surfaced to submitters of an [`ElasticPool`].
//!
//! [`ElasticPool`]: crate::ElasticPool

use bulwark_utils::macros::static_str_error;
use std::{fmt, io};

static_str_error! {
    pub struct Rejected = "task rejected: worker pool and admission queue are saturated";
}

static_str_error! {
    pub struct PoolShutdown = "task rejected: worker pool is shut down";
}

/// Error returned by [`ElasticPool::submit`].
///
/// The submitted task is dropped without being run.
/// Overload errors are never retried by the pool itself,
/// it is up to the submitter to back off or to fail the originating call.
///
/// [`ElasticPool::submit`]: crate::ElasticPool::submit
#[derive(Debug)]
pub struct PoolError {
    kind: PoolErrorKind,
}

#[derive(Debug)]
enum PoolErrorKind {
    Overload(Rejected),
    Shutdown(PoolShutdown),
    Spawn(io::Error),
}

impl PoolError {
    pub(crate) const fn overload() -> Self {
        Self {
            kind: PoolErrorKind::Overload(Rejected::new()),
        }
    }

    pub(crate) const fn shutdown() -> Self {
        Self {
            kind: PoolErrorKind::Shutdown(PoolShutdown::new()),
        }
    }

    pub(crate) const fn spawn(err: io::Error) -> Self {
        Self {
            kind: PoolErrorKind::Spawn(err),
        }
    }

    /// The pool and its queue had no capacity left, even after the bounded retry.
    #[must_use]
    pub fn is_overload(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Overload(_))
    }

    /// The pool was already shut down when the task was submitted.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Shutdown(_))
    }

    /// The OS refused to spawn a new worker thread.
    #[must_use]
    pub fn is_spawn(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Spawn(_))
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PoolErrorKind::Overload(err) => err.fmt(f),
            PoolErrorKind::Shutdown(err) => err.fmt(f),
            PoolErrorKind::Spawn(_) => f.write_str("task rejected: failed to spawn worker thread"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PoolErrorKind::Overload(_) | PoolErrorKind::Shutdown(_) => None,
            PoolErrorKind::Spawn(err) => Some(err),
        }
    }
}
