//! # dscm-ad
//!
//! Reverse-mode automatic differentiation for deep structural causal models.
//!
//! Provides:
//! - [`tape::Tape`]: matrix-valued computation tape with a single backward sweep
//! - [`matrix::VarMatrix`]: shape-tracked matrix handles (dense layers, broadcasting)
//! - [`params::ParamStore`]: named trainable parameters bound onto a tape
//! - [`math`]: numerically stable scalar kernels

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod math;
pub mod matrix;
pub mod params;
pub mod tape;

pub use matrix::VarMatrix;
pub use params::{BoundParams, Param, ParamId, ParamStore};
pub use tape::{Tape, Var};
