//! # binfit-core
//!
//! Core types shared across the binfit workspace: the error taxonomy and the
//! serializable fit-result type. Higher-level crates (`binfit-tensor`,
//! `binfit-inference`) depend only on this crate, never on each other's
//! internals.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy and `Result` alias.
pub mod error;
/// Shared result types.
pub mod types;

pub use error::{Error, Result};
pub use types::FitResult;
