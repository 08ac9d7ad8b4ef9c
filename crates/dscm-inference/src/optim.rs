//! Adam with per-parameter settings.

use std::fmt;

use dscm_ad::params::ParamStore;
use dscm_core::{Error, Result};
use nalgebra::DMatrix;

/// Adam hyper-parameters of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    /// Learning rate.
    pub lr: f64,
    /// Decay rates of the first and second moments.
    pub betas: (f64, f64),
    /// Denominator offset.
    pub eps: f64,
    /// Use the running maximum of the second moment.
    pub amsgrad: bool,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self { lr: 1e-3, betas: (0.9, 0.999), eps: 1e-8, amsgrad: false, weight_decay: 0.0 }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: DMatrix<f64>,
    v: DMatrix<f64>,
    v_max: DMatrix<f64>,
    t: i32,
}

impl Moments {
    fn zeros(shape: (usize, usize)) -> Self {
        let z = DMatrix::zeros(shape.0, shape.1);
        Self { m: z.clone(), v: z.clone(), v_max: z, t: 0 }
    }
}

/// Maps a parameter name to its settings.
pub type PerParam = Box<dyn Fn(&str) -> AdamParams + Send + Sync>;

/// Adam whose settings are looked up per parameter name on first use.
pub struct Adam {
    per_param: PerParam,
    state: Vec<Option<(AdamParams, Moments)>>,
}

impl fmt::Debug for Adam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initialised = self.state.iter().filter(|s| s.is_some()).count();
        write!(f, "Adam(initialised={initialised})")
    }
}

impl Adam {
    /// Optimizer with a per-parameter callable.
    pub fn new(per_param: impl Fn(&str) -> AdamParams + Send + Sync + 'static) -> Self {
        Self { per_param: Box::new(per_param), state: Vec::new() }
    }

    /// Same settings for every parameter.
    pub fn uniform(params: AdamParams) -> Self {
        Self::new(move |_| params)
    }

    /// Settings that apply to `name`.
    pub fn params_for(&self, name: &str) -> AdamParams {
        (self.per_param)(name)
    }

    /// Update every parameter of `store` with its gradient.
    pub fn step(&mut self, store: &mut ParamStore, grads: &[DMatrix<f64>]) -> Result<()> {
        if grads.len() != store.len() {
            return Err(Error::Validation(format!(
                "{} gradients for {} parameters",
                grads.len(),
                store.len()
            )));
        }
        if self.state.len() < store.len() {
            self.state.resize_with(store.len(), || None);
        }
        for ((id, param), g) in store.iter_mut().zip(grads) {
            if g.shape() != param.value.shape() {
                return Err(Error::Validation(format!(
                    "gradient shape {:?} does not match parameter '{}' {:?}",
                    g.shape(),
                    param.name,
                    param.value.shape()
                )));
            }
            let slot = &mut self.state[id.index()];
            let (hp, mom) = slot
                .get_or_insert_with(|| ((self.per_param)(&param.name), Moments::zeros(g.shape())));
            adam_update(&mut param.value, g, hp, mom);
        }
        Ok(())
    }
}

fn adam_update(p: &mut DMatrix<f64>, grad: &DMatrix<f64>, hp: &AdamParams, mom: &mut Moments) {
    let (b1, b2) = hp.betas;
    mom.t += 1;
    let bc1 = 1.0 - b1.powi(mom.t);
    let bc2 = 1.0 - b2.powi(mom.t);
    for i in 0..p.len() {
        let g = grad[i] + hp.weight_decay * p[i];
        mom.m[i] = b1 * mom.m[i] + (1.0 - b1) * g;
        mom.v[i] = b2 * mom.v[i] + (1.0 - b2) * g * g;
        let v = if hp.amsgrad {
            mom.v_max[i] = mom.v_max[i].max(mom.v[i]);
            mom.v_max[i]
        } else {
            mom.v[i]
        };
        let denom = (v / bc2).sqrt() + hp.eps;
        p[i] -= hp.lr * (mom.m[i] / bc1) / denom;
    }
}
