//! Probability building blocks for deep structural causal models.
//!
//! This crate hosts the probability math used by the causal mechanisms and the guide:
//! - base log-densities (Normal, Bernoulli) in `f64` and on the autodiff tape
//! - elementwise bijections and their compositions (normalising-flow steps)
//! - tape-bound distributions and their immutable snapshots for traces

pub mod bernoulli;
pub mod distributions;
pub mod normal;
pub mod transforms;

pub use dscm_ad::math;
pub use distributions::{DistDescriptor, Distribution};
pub use transforms::{Transform, TransformChain, TransformDescriptor};
