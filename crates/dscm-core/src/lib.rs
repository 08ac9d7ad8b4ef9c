//! # dscm-core
//!
//! Shared error and result types for deep structural causal models.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Metrics, StepOutput};
