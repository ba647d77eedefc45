//! Error types for bulwark.
//!
//! The [`BoxError`] type is a type-erased error type that can be used to represent any error that
//! implements the `std::error::Error` trait. It is used at the seams where it is usually not
//! that important what specific error type is returned, but rather that an error occurred,
//! such as a failing listener or a regulation step that could not be applied.
//!
//! Use [`ErrorContext`] to attach a context message to a `Result` or `Option`.

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

mod ext;
pub use ext::{ErrorContext, OpaqueError};
