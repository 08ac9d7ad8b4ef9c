//! Causal mechanisms of the continuous covariates.
//!
//! Each covariate is `exp(norm_loc + norm_scale · f(ε))` with `ε ~ N(0, 1)`
//! and `f` a learned affine map, either unconditional or conditioned on the
//! normalised parents. All trainable parameters live under the
//! `flow_components.` prefix so the optimizer can give them their own rate.

use dscm_ad::matrix::VarMatrix;
use dscm_ad::params::{BoundParams, ParamId, ParamStore};
use dscm_ad::tape::Tape;
use dscm_core::{Error, Result};
use dscm_prob::{Distribution, Transform, TransformChain};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::nn::DenseNet;

/// Name prefix of causal-mechanism parameters.
pub const FLOW_PREFIX: &str = "flow_components";

/// Full parameter name for a flow component.
pub fn flow_param(name: &str) -> String {
    format!("{FLOW_PREFIX}.{name}")
}

/// Fixed log-space normalisation of a positive covariate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogNormalization {
    /// Mean of `ln v`.
    pub loc: f64,
    /// Standard deviation of `ln v`.
    pub scale: f64,
}

impl LogNormalization {
    /// Checked constructor.
    pub fn new(loc: f64, scale: f64) -> Result<Self> {
        let n = Self { loc, scale };
        n.validate()?;
        Ok(n)
    }

    /// `scale` must be positive and both finite.
    pub fn validate(&self) -> Result<()> {
        if !(self.loc.is_finite() && self.scale.is_finite() && self.scale > 0.0) {
            return Err(Error::Validation(format!(
                "normalisation needs finite loc and scale > 0, got loc={}, scale={}",
                self.loc, self.scale
            )));
        }
        Ok(())
    }

    /// `[Affine(loc, scale), Exp]`, mapping normalised space to values.
    pub fn transforms(&self, tape: &mut Tape) -> Result<Vec<Transform>> {
        Ok(vec![Transform::affine_const(tape, self.loc, self.scale)?, Transform::Exp])
    }

    /// `(ln v − loc) / scale`
    pub fn normalize(&self, tape: &mut Tape, v: &VarMatrix) -> VarMatrix {
        v.ln(tape).shift(tape, -self.loc).scale(tape, 1.0 / self.scale)
    }

    /// `f64` version of [`normalize`](Self::normalize).
    pub fn normalize_value(&self, v: &DMatrix<f64>) -> DMatrix<f64> {
        v.map(|x| (x.ln() - self.loc) / self.scale)
    }
}

/// Unconditional learned affine map `ε ↦ loc + exp(log_scale) · ε`.
#[derive(Debug, Clone)]
pub struct AffineFlow {
    loc: ParamId,
    log_scale: ParamId,
}

impl AffineFlow {
    /// Register `flow_components.{name}.loc` and `.log_scale`, both zero.
    pub fn new(store: &mut ParamStore, name: &str) -> Result<Self> {
        let loc = store.register(flow_param(&format!("{name}.loc")), DMatrix::zeros(1, 1))?;
        let log_scale = store.register(flow_param(&format!("{name}.log_scale")), DMatrix::zeros(1, 1))?;
        Ok(Self { loc, log_scale })
    }

    /// The affine transform for the current parameters.
    pub fn transform(&self, tape: &mut Tape, params: &BoundParams) -> Transform {
        let scale = params.get(self.log_scale).exp(tape);
        Transform::affine(*params.get(self.loc), scale)
    }
}

/// Affine map whose `loc` and `log scale` are produced by a network of the context.
#[derive(Debug, Clone)]
pub struct ConditionalAffineFlow {
    net: DenseNet,
    context_dim: usize,
}

impl ConditionalAffineFlow {
    /// Network `context_dim → hidden… → 2` registered under `flow_components.{name}`.
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        context_dim: usize,
        hidden: &[usize],
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut widths = hidden.to_vec();
        widths.push(2);
        let net = DenseNet::new(store, &flow_param(name), context_dim, &widths, false, rng)?;
        Ok(Self { net, context_dim })
    }

    /// Per-row affine transform for an `n × context_dim` context.
    pub fn transform(&self, tape: &mut Tape, params: &BoundParams, context: &VarMatrix) -> Result<Transform> {
        if context.ncols() != self.context_dim {
            return Err(Error::Validation(format!(
                "conditional flow expects {} context columns, got {}",
                self.context_dim,
                context.ncols()
            )));
        }
        let out = self.net.forward(tape, params, context)?;
        let loc = out.select_cols(tape, &[0])?;
        let scale = out.select_cols(tape, &[1])?.exp(tape);
        Ok(Transform::affine(loc, scale))
    }
}

/// Mechanism of one positive covariate.
#[derive(Debug, Clone)]
pub enum CovariateMechanism {
    /// Parents are ignored.
    Unconditional(AffineFlow),
    /// Conditioned on the normalised parents.
    Conditional(ConditionalAffineFlow),
}

impl CovariateMechanism {
    /// `exp(norm · flow(N(0, 1)))` for `n` rows. A conditional mechanism needs `context`.
    pub fn distribution(
        &self,
        tape: &mut Tape,
        params: &BoundParams,
        n: usize,
        context: Option<&VarMatrix>,
        norm: &LogNormalization,
    ) -> Result<Distribution> {
        let flow = match (self, context) {
            (CovariateMechanism::Unconditional(f), _) => f.transform(tape, params),
            (CovariateMechanism::Conditional(f), Some(ctx)) => f.transform(tape, params, ctx)?,
            (CovariateMechanism::Conditional(_), None) => {
                return Err(Error::Validation("conditional mechanism evaluated without parents".to_string()));
            }
        };
        let mut parts = vec![flow];
        parts.extend(norm.transforms(tape)?);
        let base = Distribution::standard_normal(tape, n, 1);
        Ok(Distribution::transformed(base, TransformChain::new(parts)))
    }
}
