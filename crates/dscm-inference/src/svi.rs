//! Stochastic variational inference driver.

use dscm_core::Result;
use rand::rngs::StdRng;

use crate::config::ExperimentConfig;
use crate::elbo::{RetainingElbo, TraceGraphElbo};
use crate::flows::FLOW_PREFIX;
use crate::optim::{Adam, AdamParams};
use crate::scm::{GuideKind, StructuralCausalModel, SviGuide, SviModel};
use crate::values::Observation;

/// Denominator offset shared by both parameter groups.
pub const ADAM_EPS: f64 = 1e-5;

/// Optimizer settings for the parameter `name`: causal-mechanism flows train
/// with `pgm_lr`, everything else with `lr`.
pub fn adam_params(config: &ExperimentConfig, name: &str) -> AdamParams {
    let lr = if name.contains(FLOW_PREFIX) { config.pgm_lr } else { config.lr };
    AdamParams {
        lr,
        eps: ADAM_EPS,
        amsgrad: config.use_amsgrad,
        weight_decay: config.l2,
        ..AdamParams::default()
    }
}

/// Owns the model, the objective and the optimizer.
pub struct Svi {
    model: Box<dyn StructuralCausalModel>,
    loss: RetainingElbo,
    optim: Adam,
    guide: GuideKind,
}

impl std::fmt::Debug for Svi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Svi")
            .field("kind", &self.model.kind())
            .field("num_params", &self.model.params().len())
            .field("guide", &self.guide)
            .field("optim", &self.optim)
            .finish()
    }
}

impl Svi {
    /// Driver for `model`; the guide is chosen here once.
    pub fn new(model: Box<dyn StructuralCausalModel>, config: &ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let loss = RetainingElbo::new(TraceGraphElbo::new(config.num_svi_particles)?);
        let routing = config.clone();
        let optim = Adam::new(move |name| adam_params(&routing, name));
        let guide = if config.use_cf_guide {
            GuideKind::Counterfactual(config.cf_elbo_type)
        } else {
            GuideKind::Posterior
        };
        log::debug!(
            "svi: {} parameters ({} scalars), guide {:?}",
            model.params().len(),
            model.params().num_scalars(),
            guide
        );
        Ok(Self { model, loss, optim, guide })
    }

    /// One gradient step on `obs`. Returns the loss before the update.
    ///
    /// A `Random` counterfactual type is drawn once for the batch and shared by
    /// every particle.
    ///
    /// A NaN loss leaves the parameters untouched; the caller decides how to fail.
    pub fn step(&mut self, obs: &Observation, rng: &mut StdRng) -> Result<f64> {
        let kind = self.guide.for_batch(rng);
        let (loss, grads) = {
            let scm = &*self.model;
            let model = SviModel { scm, obs };
            let guide = SviGuide { scm, obs, kind };
            self.loss.loss_and_grads(&model, &guide, scm.params(), rng)?
        };
        if loss.is_nan() {
            log::warn!("svi: NaN loss, skipping parameter update");
            return Ok(loss);
        }
        self.optim.step(self.model.params_mut(), &grads)?;
        Ok(loss)
    }

    /// Loss on `obs` without updating parameters, with the guide fixed per batch
    /// as in [`step`](Self::step).
    pub fn evaluate_loss(&mut self, obs: &Observation, rng: &mut StdRng) -> Result<f64> {
        let kind = self.guide.for_batch(rng);
        let scm = &*self.model;
        let model = SviModel { scm, obs };
        let guide = SviGuide { scm, obs, kind };
        self.loss.loss(&model, &guide, scm.params(), rng)
    }

    /// The model being trained.
    pub fn model(&self) -> &dyn StructuralCausalModel {
        &*self.model
    }

    /// The model, mutably.
    pub fn model_mut(&mut self) -> &mut dyn StructuralCausalModel {
        &mut *self.model
    }

    /// Objective with the retained traces.
    pub fn loss(&self) -> &RetainingElbo {
        &self.loss
    }

    /// Guide used for optimization.
    pub fn guide_kind(&self) -> GuideKind {
        self.guide
    }

    /// Optimizer.
    pub fn optimizer(&self) -> &Adam {
        &self.optim
    }
}
