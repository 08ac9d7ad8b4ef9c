//! Batched distributions on the autodiff tape.
//!
//! Every distribution has an `n × d` shape: `n` independent batch rows, each
//! with `d` event dimensions. `log_prob` is elementwise; callers sum over the
//! event dimension to obtain per-row log-densities.

use std::fmt;

use dscm_ad::matrix::VarMatrix;
use dscm_ad::math::sigmoid;
use dscm_ad::tape::Tape;
use dscm_core::{Error, Result};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::bernoulli::logpmf_logit_var;
use crate::normal::logpdf_var;
use crate::transforms::{TransformChain, TransformDescriptor, broadcast_at, fmt_matrix};

/// Tape-bound distribution.
#[derive(Debug, Clone)]
pub enum Distribution {
    /// Independent normals.
    Normal {
        /// Mean.
        loc: VarMatrix,
        /// Standard deviation.
        scale: VarMatrix,
    },
    /// Independent Bernoullis over `{0, 1}`.
    Bernoulli {
        /// Log-odds.
        logits: VarMatrix,
    },
    /// Push-forward of `base` through `transforms`.
    Transformed {
        /// Base distribution.
        base: Box<Distribution>,
        /// Elementwise bijections applied to base samples.
        transforms: TransformChain,
    },
}

impl Distribution {
    /// Normal with matching `loc`/`scale` shapes.
    pub fn normal(loc: VarMatrix, scale: VarMatrix) -> Result<Self> {
        if loc.shape() != scale.shape() {
            return Err(Error::Validation(format!(
                "Normal: loc shape {:?} != scale shape {:?}",
                loc.shape(),
                scale.shape()
            )));
        }
        Ok(Distribution::Normal { loc, scale })
    }

    /// Standard normal of the given shape (constant parameters).
    pub fn standard_normal(tape: &mut Tape, nrows: usize, ncols: usize) -> Self {
        Distribution::Normal {
            loc: VarMatrix::filled(tape, nrows, ncols, 0.0),
            scale: VarMatrix::filled(tape, nrows, ncols, 1.0),
        }
    }

    /// Bernoulli with log-odds `logits`.
    pub fn bernoulli(logits: VarMatrix) -> Self {
        Distribution::Bernoulli { logits }
    }

    /// `base` pushed through `transforms`.
    pub fn transformed(base: Distribution, transforms: TransformChain) -> Self {
        Distribution::Transformed { base: Box::new(base), transforms }
    }

    /// `(batch rows, event dims)`
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Distribution::Normal { loc, .. } => loc.shape(),
            Distribution::Bernoulli { logits } => logits.shape(),
            Distribution::Transformed { base, .. } => base.shape(),
        }
    }

    /// Whether samples are differentiable functions of the parameters.
    pub fn has_rsample(&self) -> bool {
        match self {
            Distribution::Normal { .. } => true,
            Distribution::Bernoulli { .. } => false,
            Distribution::Transformed { base, .. } => base.has_rsample(),
        }
    }

    fn check_shape(&self, value: &VarMatrix) -> Result<()> {
        if value.shape() != self.shape() {
            return Err(Error::Validation(format!(
                "value shape {:?} does not match distribution shape {:?}",
                value.shape(),
                self.shape()
            )));
        }
        Ok(())
    }

    /// Elementwise log-density of `value`.
    pub fn log_prob(&self, tape: &mut Tape, value: &VarMatrix) -> Result<VarMatrix> {
        Ok(self.log_prob_with_base(tape, value)?.0)
    }

    /// Elementwise log-density of `value`, plus the base-distribution value for
    /// transformed distributions (the recovered exogenous noise).
    pub fn log_prob_with_base(
        &self,
        tape: &mut Tape,
        value: &VarMatrix,
    ) -> Result<(VarMatrix, Option<VarMatrix>)> {
        self.check_shape(value)?;
        match self {
            Distribution::Normal { loc, scale } => {
                let lp = logpdf_var(tape, value.var(), loc.var(), scale.var())?;
                Ok((VarMatrix::from_var(tape, lp), None))
            }
            Distribution::Bernoulli { logits } => {
                let lp = logpmf_logit_var(tape, value.var(), logits.var())?;
                Ok((VarMatrix::from_var(tape, lp), None))
            }
            Distribution::Transformed { base, transforms } => {
                let (x, ldj) = transforms.inverse_with_log_det(tape, value)?;
                let base_lp = base.log_prob(tape, &x)?;
                Ok((base_lp.sub(tape, &ldj)?, Some(x)))
            }
        }
    }

    /// Draw a sample; reparameterised whenever [`has_rsample`](Self::has_rsample) holds.
    pub fn rsample<R: Rng>(&self, tape: &mut Tape, rng: &mut R) -> Result<VarMatrix> {
        Ok(self.rsample_with_base(tape, rng)?.0)
    }

    /// Draw a sample, also returning the base sample of transformed distributions.
    pub fn rsample_with_base<R: Rng>(
        &self,
        tape: &mut Tape,
        rng: &mut R,
    ) -> Result<(VarMatrix, Option<VarMatrix>)> {
        match self {
            Distribution::Normal { loc, scale } => {
                let (n, d) = loc.shape();
                let eps = DMatrix::from_fn(n, d, |_, _| rng.sample::<f64, _>(StandardNormal));
                let eps = VarMatrix::constant(tape, &eps);
                Ok((eps.mul(tape, scale)?.add(tape, loc)?, None))
            }
            Distribution::Bernoulli { logits } => {
                let p = logits.value(tape).map(sigmoid);
                let draws = p.map(|pi| if rng.random::<f64>() < pi { 1.0 } else { 0.0 });
                Ok((VarMatrix::constant(tape, &draws), None))
            }
            Distribution::Transformed { base, transforms } => {
                let x = base.rsample(tape, rng)?;
                let y = transforms.forward(tape, &x)?;
                Ok((y, Some(x)))
            }
        }
    }

    /// Draw a sample together with its elementwise log-density and, for transformed
    /// distributions, the base sample. Transformed densities are evaluated on the
    /// forward path, so no inversion of the drawn value is needed.
    pub fn rsample_with_log_prob<R: Rng>(
        &self,
        tape: &mut Tape,
        rng: &mut R,
    ) -> Result<(VarMatrix, VarMatrix, Option<VarMatrix>)> {
        match self {
            Distribution::Transformed { base, transforms } => {
                let (x, base_lp, _) = base.rsample_with_log_prob(tape, rng)?;
                let (y, ldj) = transforms.forward_with_log_det(tape, &x)?;
                Ok((y, base_lp.sub(tape, &ldj)?, Some(x)))
            }
            _ => {
                let value = self.rsample(tape, rng)?;
                let lp = self.log_prob(tape, &value)?;
                Ok((value, lp, None))
            }
        }
    }

    /// Snapshot of the current parameter values.
    pub fn describe(&self, tape: &Tape) -> DistDescriptor {
        match self {
            Distribution::Normal { loc, scale } => {
                DistDescriptor::Normal { loc: loc.value(tape), scale: scale.value(tape) }
            }
            Distribution::Bernoulli { logits } => DistDescriptor::Bernoulli { logits: logits.value(tape) },
            Distribution::Transformed { base, transforms } => DistDescriptor::Transformed {
                base: Box::new(base.describe(tape)),
                transforms: transforms.describe(tape),
            },
        }
    }
}

/// Immutable `f64` snapshot of a [`Distribution`], as stored in traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistDescriptor {
    /// Independent normals.
    Normal {
        /// Mean.
        loc: DMatrix<f64>,
        /// Standard deviation.
        scale: DMatrix<f64>,
    },
    /// Independent Bernoullis.
    Bernoulli {
        /// Log-odds.
        logits: DMatrix<f64>,
    },
    /// Push-forward of `base`.
    Transformed {
        /// Base distribution.
        base: Box<DistDescriptor>,
        /// Bijections in application order.
        transforms: Vec<TransformDescriptor>,
    },
    /// Point mass at the recorded value (deterministic and intervened sites).
    Delta,
}

impl DistDescriptor {
    /// Support of the distribution, named after the constraint.
    pub fn support(&self) -> &'static str {
        match self {
            DistDescriptor::Normal { .. } => "real",
            DistDescriptor::Bernoulli { .. } => "boolean",
            DistDescriptor::Transformed { transforms, .. } => match transforms.last() {
                Some(TransformDescriptor::Exp) => "positive",
                Some(TransformDescriptor::Sigmoid) => "unit_interval",
                Some(TransformDescriptor::Affine { .. }) | None => "real",
            },
            DistDescriptor::Delta => "real",
        }
    }

    /// Whether sampling is reparameterised.
    pub fn has_rsample(&self) -> bool {
        match self {
            DistDescriptor::Normal { .. } | DistDescriptor::Delta => true,
            DistDescriptor::Bernoulli { .. } => false,
            DistDescriptor::Transformed { base, .. } => base.has_rsample(),
        }
    }

    /// Draw an independent sample with the same parameters.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Result<DMatrix<f64>> {
        match self {
            DistDescriptor::Normal { loc, scale } => Ok(DMatrix::from_fn(loc.nrows(), loc.ncols(), |i, j| {
                let e: f64 = rng.sample(StandardNormal);
                loc[(i, j)] + broadcast_at(scale, i, j) * e
            })),
            DistDescriptor::Bernoulli { logits } => {
                Ok(logits.map(|l| if rng.random::<f64>() < sigmoid(l) { 1.0 } else { 0.0 }))
            }
            DistDescriptor::Transformed { base, transforms } => {
                let x = base.sample(rng)?;
                Ok(transforms.iter().fold(x, |acc, t| t.forward(&acc)))
            }
            DistDescriptor::Delta => {
                Err(Error::Computation("cannot sample a point mass without its value".to_string()))
            }
        }
    }
}

impl fmt::Display for DistDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistDescriptor::Normal { loc, scale } => {
                write!(f, "Normal(loc: {}, scale: {})", fmt_matrix(loc), fmt_matrix(scale))
            }
            DistDescriptor::Bernoulli { logits } => write!(f, "Bernoulli(logits: {})", fmt_matrix(logits)),
            DistDescriptor::Transformed { base, transforms } => {
                let ts: Vec<String> = transforms.iter().map(|t| t.to_string()).collect();
                write!(f, "TransformedDistribution(base: {base}, transforms: [{}])", ts.join(", "))
            }
            DistDescriptor::Delta => write!(f, "Delta"),
        }
    }
}
