//! Named trainable parameters.
//!
//! A [`ParamStore`] owns every trainable matrix of a model. Before each
//! objective evaluation the store is bound onto a fresh [`Tape`]; after the
//! backward sweep [`BoundParams::gradients`] returns one gradient matrix per
//! parameter, in registration order, ready for the optimizer.

use dscm_core::{Error, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::matrix::VarMatrix;
use crate::tape::Tape;

/// Handle to a registered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(usize);

impl ParamId {
    /// Registration index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A named parameter matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    /// Dotted path, e.g. `flow_components.age.loc`.
    pub name: String,
    /// Current value.
    pub value: DMatrix<f64>,
}

/// Ordered collection of uniquely named parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamStore {
    params: Vec<Param>,
}

impl ParamStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new parameter. Names must be unique.
    pub fn register(&mut self, name: impl Into<String>, value: DMatrix<f64>) -> Result<ParamId> {
        let name = name.into();
        if self.id_of(&name).is_some() {
            return Err(Error::Validation(format!("duplicate parameter name '{name}'")));
        }
        if value.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("parameter '{name}' has non-finite initial values")));
        }
        self.params.push(Param { name, value });
        Ok(ParamId(self.params.len() - 1))
    }

    /// Number of parameter matrices.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameter is registered.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_scalars(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    /// Look up a parameter handle by name.
    pub fn id_of(&self, name: &str) -> Option<ParamId> {
        self.params.iter().position(|p| p.name == name).map(ParamId)
    }

    /// Parameter by handle.
    pub fn get(&self, id: ParamId) -> &Param {
        &self.params[id.0]
    }

    /// Current value by handle.
    pub fn value(&self, id: ParamId) -> &DMatrix<f64> {
        &self.params[id.0].value
    }

    /// Mutable value by handle.
    pub fn value_mut(&mut self, id: ParamId) -> &mut DMatrix<f64> {
        &mut self.params[id.0].value
    }

    /// Iterate parameters in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Param)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    /// Iterate parameters mutably in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Param)> {
        self.params.iter_mut().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    /// Parameter names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    /// Place every parameter on `tape` as a differentiable input, one node per matrix.
    pub fn bind(&self, tape: &mut Tape) -> BoundParams {
        BoundParams { mats: self.params.iter().map(|p| VarMatrix::input(tape, &p.value)).collect() }
    }

    /// Place every parameter on `tape` as a constant (no gradients needed).
    pub fn bind_constant(&self, tape: &mut Tape) -> BoundParams {
        BoundParams {
            mats: self.params.iter().map(|p| VarMatrix::constant(tape, &p.value)).collect(),
        }
    }
}

/// Parameters recorded on one tape.
#[derive(Debug, Clone)]
pub struct BoundParams {
    mats: Vec<VarMatrix>,
}

impl BoundParams {
    /// Tape variables of a parameter.
    pub fn get(&self, id: ParamId) -> &VarMatrix {
        &self.mats[id.0]
    }

    /// Gradients of the last backward sweep, one matrix per parameter.
    pub fn gradients(&self, tape: &Tape) -> Vec<DMatrix<f64>> {
        self.mats.iter().map(|m| tape.gradient(m.var())).collect()
    }
}
