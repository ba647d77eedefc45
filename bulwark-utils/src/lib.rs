//! utilities crate for bulwark
//!
//! `bulwark-utils` contains utilities used by the other bulwark crates,
//! not really being part of one of them, or used by plenty of them.

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(test, allow(clippy::float_cmp))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

#[doc(hidden)]
#[macro_use]
pub mod macros;

pub mod time;
