//! Structural causal model interface.
//!
//! A model variant supplies the generative process ([`model`]), the amortised
//! posterior over the latent code ([`infer_posterior`]) and abduction of the
//! exogenous noise ([`infer_exogenous`]). Everything else (conditioned
//! training programs, sampling, inference, reconstruction and counterfactuals)
//! is provided on top of those three.
//!
//! [`model`]: StructuralCausalModel::model
//! [`infer_posterior`]: StructuralCausalModel::infer_posterior
//! [`infer_exogenous`]: StructuralCausalModel::infer_exogenous

use dscm_ad::matrix::VarMatrix;
use dscm_ad::params::{BoundParams, ParamStore};
use dscm_ad::tape::Tape;
use dscm_core::Result;
use dscm_prob::Distribution;
use nalgebra::DMatrix;
use rand::rngs::StdRng;

use crate::config::{CounterfactualType, ScmConfig, ScmKind};
use crate::counterfactual;
use crate::exec::{ExecCtx, Overrides, Program};
use crate::trace::Trace;
use crate::values::{Observation, ObservedVars, ScmSample, ScmVars, Values};
use crate::visem::{ConditionalVisem, IndependentVisem};

/// Deep structural causal model over `{sex, age, ventricle_volume, brain_volume, x}`
/// with latent code `z`.
pub trait StructuralCausalModel: Send + Sync {
    /// Variant tag.
    fn kind(&self) -> ScmKind;

    /// Dimension of `z`.
    fn latent_dim(&self) -> usize;

    /// Pixels per image.
    fn num_pixels(&self) -> usize;

    /// Trainable parameters.
    fn params(&self) -> &ParamStore;

    /// Trainable parameters, mutably (for the optimizer).
    fn params_mut(&mut self) -> &mut ParamStore;

    /// The generative process for `n` rows, in topological order.
    fn model(&self, ctx: &mut ExecCtx<'_>, n: usize) -> Result<ScmVars>;

    /// Approximate posterior `q(z | observation)`.
    fn infer_posterior(&self, tape: &mut Tape, params: &BoundParams, obs: &ObservedVars) -> Result<Distribution>;

    /// Recover the exogenous noise of every transformed site given `z` and the
    /// observation, keyed `{name}_base`.
    fn infer_exogenous(&self, z: &DMatrix<f64>, obs: &Observation, rng: &mut StdRng) -> Result<Values>;

    /// Sample `z` from the approximate posterior.
    fn guide(&self, ctx: &mut ExecCtx<'_>, obs: &ObservedVars) -> Result<VarMatrix> {
        let params = ctx.params();
        let q = self.infer_posterior(ctx.tape(), params, obs)?;
        ctx.sample("z", &q)
    }

    /// The model inside a batch plate, conditioned on the observation.
    fn svi_model(&self, ctx: &mut ExecCtx<'_>, obs: &Observation) -> Result<()> {
        ctx.enter_plate(obs.batch_size());
        ctx.observe(&obs.to_values());
        self.model(ctx, obs.batch_size())?;
        Ok(())
    }

    /// The guide inside a batch plate. Nothing is conditioned.
    fn svi_guide(&self, ctx: &mut ExecCtx<'_>, obs: &Observation) -> Result<()> {
        ctx.enter_plate(obs.batch_size());
        let observed = ObservedVars::constant(ctx.tape(), obs);
        self.guide(ctx, &observed)?;
        Ok(())
    }

    /// Guide that samples `z` from the posterior of a counterfactual of the batch.
    fn counterfactual_guide(
        &self,
        ctx: &mut ExecCtx<'_>,
        obs: &Observation,
        cf_type: CounterfactualType,
    ) -> Result<()> {
        counterfactual::counterfactual_guide(self, ctx, obs, cf_type)
    }

    /// Run the generative process once without gradients.
    fn generate(
        &self,
        n: usize,
        overrides: &Overrides,
        reparam: bool,
        rng: &mut StdRng,
    ) -> Result<(ScmSample, Trace)> {
        let mut tape = Tape::new();
        let bound = self.params().bind_constant(&mut tape);
        let mut ctx = ExecCtx::new(&mut tape, &bound, rng).with_overrides(overrides);
        if reparam {
            ctx = ctx.reparameterized();
        }
        let vars = self.model(&mut ctx, n)?;
        let recorded = ctx.finish();
        Ok((vars.value(&tape), recorded.trace))
    }

    /// Draw `n` instances from the generative process.
    fn sample(&self, n: usize, overrides: &Overrides, rng: &mut StdRng) -> Result<ScmSample> {
        Ok(self.generate(n, overrides, false, rng)?.0)
    }

    /// Draw `n` instances with every exogenous noise exposed as a `{name}_base` site.
    fn sample_scm(&self, n: usize, overrides: &Overrides, rng: &mut StdRng) -> Result<(ScmSample, Trace)> {
        self.generate(n, overrides, true, rng)
    }

    /// Abduct `z` and the exogenous noise of an observation.
    fn infer(&self, obs: &Values, rng: &mut StdRng) -> Result<Values> {
        counterfactual::infer(self, obs, rng)
    }

    /// Monte Carlo mean image decoded from posterior samples of `z`.
    fn reconstruct(&self, obs: &Observation, num_particles: usize, rng: &mut StdRng) -> Result<DMatrix<f64>> {
        counterfactual::reconstruct(self, obs, num_particles, rng)
    }

    /// Abduction, action and prediction, averaged over particles.
    fn counterfactual(
        &self,
        obs: &Values,
        condition: &Values,
        num_particles: usize,
        rng: &mut StdRng,
    ) -> Result<ScmSample> {
        counterfactual::counterfactual(self, obs, condition, num_particles, rng)
    }
}

/// Build the model variant named by `cfg.kind`.
pub fn build_scm(cfg: &ScmConfig) -> Result<Box<dyn StructuralCausalModel>> {
    cfg.validate()?;
    Ok(match cfg.kind {
        ScmKind::Independent => Box::new(IndependentVisem::new(cfg)?),
        ScmKind::Conditional => Box::new(ConditionalVisem::new(cfg)?),
    })
}

/// Which guide the training objective uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuideKind {
    /// The amortised posterior on the observed batch.
    Posterior,
    /// The posterior on a counterfactual of the batch.
    Counterfactual(CounterfactualType),
}

impl GuideKind {
    /// The guide for one batch, with a `Random` counterfactual type fixed so
    /// every particle of the batch perturbs the same volumes.
    pub fn for_batch(self, rng: &mut StdRng) -> GuideKind {
        match self {
            GuideKind::Counterfactual(t) => GuideKind::Counterfactual(t.resolve(rng)),
            GuideKind::Posterior => GuideKind::Posterior,
        }
    }
}

/// [`StructuralCausalModel::svi_model`] bound to a batch.
pub struct SviModel<'p> {
    /// Model.
    pub scm: &'p dyn StructuralCausalModel,
    /// Batch.
    pub obs: &'p Observation,
}

impl Program for SviModel<'_> {
    fn run(&self, ctx: &mut ExecCtx<'_>) -> Result<()> {
        self.scm.svi_model(ctx, self.obs)
    }
}

/// The training guide bound to a batch.
pub struct SviGuide<'p> {
    /// Model.
    pub scm: &'p dyn StructuralCausalModel,
    /// Batch.
    pub obs: &'p Observation,
    /// Posterior or counterfactual guide.
    pub kind: GuideKind,
}

impl Program for SviGuide<'_> {
    fn run(&self, ctx: &mut ExecCtx<'_>) -> Result<()> {
        match self.kind {
            GuideKind::Posterior => self.scm.svi_guide(ctx, self.obs),
            GuideKind::Counterfactual(t) => self.scm.counterfactual_guide(ctx, self.obs, t),
        }
    }
}
