//! # dscm-inference
//!
//! Deep structural causal models of brain imaging covariates.
//!
//! This crate provides:
//! - Execution traces with conditioning, interventions and replay
//! - The `sex → age → brain_volume → ventricle_volume → x` model variants
//! - ELBO training with per-group Adam and trace diagnostics
//! - Posterior inference, reconstruction and counterfactuals
//!
//! ## Architecture
//!
//! Models are plain Rust functions over an [`exec::ExecCtx`]; the context, not
//! the model, decides whether a site is sampled, observed, replayed or
//! intervened on. Every execution leaves a [`trace::Trace`] behind.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Run configuration with serde defaults.
pub mod config;
/// Abduction, reconstruction, counterfactuals and the counterfactual guide.
pub mod counterfactual;
/// Per-site metrics and trace logging.
pub mod diagnostics;
/// ELBO estimator and the trace-retaining wrapper.
pub mod elbo;
/// Execution context for probabilistic programs.
pub mod exec;
/// Training, validation and test steps.
pub mod experiment;
/// Normalising flows of the continuous covariates.
pub mod flows;
/// Dense network building blocks.
pub mod nn;
/// Adam with per-parameter settings.
pub mod optim;
/// Structural causal model interface and construction table.
pub mod scm;
/// SVI driver.
pub mod svi;
/// Execution traces.
pub mod trace;
/// Named values, observations and samples.
pub mod values;
/// Concrete model variants.
pub mod visem;

pub use config::{CounterfactualType, ExperimentConfig, ScmConfig, ScmKind};
pub use elbo::{RetainingElbo, TraceGraphElbo};
pub use exec::{ExecCtx, Overrides, Program};
pub use experiment::SviExperiment;
pub use optim::{Adam, AdamParams};
pub use scm::{GuideKind, StructuralCausalModel, build_scm};
pub use svi::Svi;
pub use trace::{Site, SiteKind, Trace};
pub use values::{Observation, RawBatch, ScmSample, Values, Variable};
