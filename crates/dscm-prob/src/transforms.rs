//! Elementwise bijections for normalising flows.
//!
//! A [`Transform`] maps an `n × d` matrix to an `n × d` matrix elementwise and
//! lives on the autodiff tape, so learned flow parameters receive gradients
//! through both sampling (`forward`) and density evaluation (`inverse` plus the
//! log-Jacobian). A [`TransformChain`] composes transforms left to right:
//! `y = t_k(...t_2(t_1(x)))`.
//!
//! [`TransformDescriptor`] is the `f64` snapshot stored in traces.

use std::fmt;

use dscm_ad::matrix::VarMatrix;
use dscm_ad::math::{logit, sigmoid};
use dscm_ad::tape::Tape;
use dscm_core::{Error, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Elementwise bijection recorded on a tape.
#[derive(Debug, Clone)]
pub enum Transform {
    /// `y = loc + scale * x` with `scale > 0`; `loc`/`scale` broadcast onto `x`.
    Affine {
        /// Shift.
        loc: VarMatrix,
        /// Positive scale.
        scale: VarMatrix,
    },
    /// `y = exp(x)`
    Exp,
    /// `y = 1 / (1 + exp(-x))`
    Sigmoid,
}

impl Transform {
    /// Affine transform with tape-valued parameters.
    pub fn affine(loc: VarMatrix, scale: VarMatrix) -> Self {
        Transform::Affine { loc, scale }
    }

    /// Affine transform with constant parameters.
    pub fn affine_const(tape: &mut Tape, loc: f64, scale: f64) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) || !loc.is_finite() {
            return Err(Error::Validation(format!(
                "affine transform needs finite loc and scale > 0, got loc={loc}, scale={scale}"
            )));
        }
        Ok(Transform::Affine {
            loc: VarMatrix::filled(tape, 1, 1, loc),
            scale: VarMatrix::filled(tape, 1, 1, scale),
        })
    }

    /// `y = T(x)`
    pub fn forward(&self, tape: &mut Tape, x: &VarMatrix) -> Result<VarMatrix> {
        match self {
            Transform::Affine { loc, scale } => x.mul(tape, scale)?.add(tape, loc),
            Transform::Exp => Ok(x.exp(tape)),
            Transform::Sigmoid => Ok(x.sigmoid(tape)),
        }
    }

    /// `x = T⁻¹(y)`
    pub fn inverse(&self, tape: &mut Tape, y: &VarMatrix) -> Result<VarMatrix> {
        match self {
            Transform::Affine { loc, scale } => y.sub(tape, loc)?.div(tape, scale),
            Transform::Exp => Ok(y.ln(tape)),
            Transform::Sigmoid => {
                let ln_y = y.ln(tape);
                let ln_1m = y.neg(tape).shift(tape, 1.0).ln(tape);
                ln_y.sub(tape, &ln_1m)
            }
        }
    }

    /// Elementwise `ln |dy/dx|` at input `x`.
    pub fn log_abs_det_jacobian(&self, tape: &mut Tape, x: &VarMatrix) -> Result<VarMatrix> {
        match self {
            Transform::Affine { scale, .. } => {
                let ln_scale = scale.ln(tape);
                VarMatrix::filled(tape, x.nrows(), x.ncols(), 0.0).add(tape, &ln_scale)
            }
            Transform::Exp => Ok(*x),
            // ln σ(x) + ln(1 - σ(x)) = -softplus(-x) - softplus(x)
            Transform::Sigmoid => {
                let a = x.neg(tape).softplus(tape);
                let b = x.softplus(tape);
                Ok(a.add(tape, &b)?.neg(tape))
            }
        }
    }

    /// Snapshot of the current parameter values.
    pub fn describe(&self, tape: &Tape) -> TransformDescriptor {
        match self {
            Transform::Affine { loc, scale } => {
                TransformDescriptor::Affine { loc: loc.value(tape), scale: scale.value(tape) }
            }
            Transform::Exp => TransformDescriptor::Exp,
            Transform::Sigmoid => TransformDescriptor::Sigmoid,
        }
    }
}

/// Composition of elementwise transforms, applied in order.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    parts: Vec<Transform>,
}

impl TransformChain {
    /// Chain applying `parts` in order.
    pub fn new(parts: Vec<Transform>) -> Self {
        Self { parts }
    }

    /// Append `other`'s transforms after this chain's.
    pub fn then(mut self, other: TransformChain) -> Self {
        self.parts.extend(other.parts);
        self
    }

    /// Append one transform.
    pub fn push(&mut self, t: Transform) {
        self.parts.push(t);
    }

    /// Transforms in application order.
    pub fn parts(&self) -> &[Transform] {
        &self.parts
    }

    /// Number of transforms.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the chain is the identity.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Push `x` through every transform.
    pub fn forward(&self, tape: &mut Tape, x: &VarMatrix) -> Result<VarMatrix> {
        let mut y = *x;
        for t in &self.parts {
            y = t.forward(tape, &y)?;
        }
        Ok(y)
    }

    /// Invert the chain.
    pub fn inverse(&self, tape: &mut Tape, y: &VarMatrix) -> Result<VarMatrix> {
        let mut x = *y;
        for t in self.parts.iter().rev() {
            x = t.inverse(tape, &x)?;
        }
        Ok(x)
    }

    /// Push `x` through the chain, also returning the elementwise `ln |dy/dx|`.
    pub fn forward_with_log_det(
        &self,
        tape: &mut Tape,
        x: &VarMatrix,
    ) -> Result<(VarMatrix, VarMatrix)> {
        let mut y = *x;
        let mut ldj = VarMatrix::filled(tape, x.nrows(), x.ncols(), 0.0);
        for t in &self.parts {
            let term = t.log_abs_det_jacobian(tape, &y)?;
            ldj = ldj.add(tape, &term)?;
            y = t.forward(tape, &y)?;
        }
        Ok((y, ldj))
    }

    /// Invert the chain and return the base value together with the elementwise
    /// `ln |dy/dx|` of the full forward map evaluated at that base value.
    pub fn inverse_with_log_det(
        &self,
        tape: &mut Tape,
        y: &VarMatrix,
    ) -> Result<(VarMatrix, VarMatrix)> {
        // Inputs of each transform, innermost last.
        let mut inputs = Vec::with_capacity(self.parts.len());
        let mut x = *y;
        for t in self.parts.iter().rev() {
            x = t.inverse(tape, &x)?;
            inputs.push(x);
        }
        let mut ldj = VarMatrix::filled(tape, y.nrows(), y.ncols(), 0.0);
        for (t, input) in self.parts.iter().rev().zip(&inputs) {
            let term = t.log_abs_det_jacobian(tape, input)?;
            ldj = ldj.add(tape, &term)?;
        }
        Ok((x, ldj))
    }

    /// Snapshot of every transform.
    pub fn describe(&self, tape: &Tape) -> Vec<TransformDescriptor> {
        self.parts.iter().map(|t| t.describe(tape)).collect()
    }
}

/// Immutable `f64` snapshot of a [`Transform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformDescriptor {
    /// `y = loc + scale * x`
    Affine {
        /// Shift.
        loc: DMatrix<f64>,
        /// Positive scale.
        scale: DMatrix<f64>,
    },
    /// `y = exp(x)`
    Exp,
    /// `y = sigmoid(x)`
    Sigmoid,
}

/// Element `(i, j)` of `m` broadcast onto a larger matrix.
pub(crate) fn broadcast_at(m: &DMatrix<f64>, i: usize, j: usize) -> f64 {
    let ii = if m.nrows() == 1 { 0 } else { i };
    let jj = if m.ncols() == 1 { 0 } else { j };
    m[(ii, jj)]
}

impl TransformDescriptor {
    /// `y = T(x)`
    pub fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            TransformDescriptor::Affine { loc, scale } => DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
                broadcast_at(loc, i, j) + broadcast_at(scale, i, j) * x[(i, j)]
            }),
            TransformDescriptor::Exp => x.map(f64::exp),
            TransformDescriptor::Sigmoid => x.map(sigmoid),
        }
    }

    /// `x = T⁻¹(y)`
    pub fn inverse(&self, y: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            TransformDescriptor::Affine { loc, scale } => DMatrix::from_fn(y.nrows(), y.ncols(), |i, j| {
                (y[(i, j)] - broadcast_at(loc, i, j)) / broadcast_at(scale, i, j)
            }),
            TransformDescriptor::Exp => y.map(f64::ln),
            TransformDescriptor::Sigmoid => y.map(logit),
        }
    }
}

impl fmt::Display for TransformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformDescriptor::Affine { loc, scale } => {
                write!(f, "Affine(loc: {}, scale: {})", fmt_matrix(loc), fmt_matrix(scale))
            }
            TransformDescriptor::Exp => write!(f, "Exp"),
            TransformDescriptor::Sigmoid => write!(f, "Sigmoid"),
        }
    }
}

/// `[[a, b], [c, d]]` rendering of a matrix, row by row.
pub fn fmt_matrix(m: &DMatrix<f64>) -> String {
    let rows: Vec<String> = m
        .row_iter()
        .map(|r| {
            let cells: Vec<String> = r.iter().map(|v| format!("{v:.6}")).collect();
            format!("[{}]", cells.join(", "))
        })
        .collect();
    format!("[{}]", rows.join(", "))
}
