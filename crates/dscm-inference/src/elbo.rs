//! Evidence lower bound.
//!
//! Each particle runs the guide, replays its latent samples into the model and
//! scores `log p(x, z) − log q(z)` on one shared tape. The loss is the negated
//! particle mean; its reverse sweep gives every parameter gradient at once.

use dscm_ad::params::{BoundParams, ParamStore};
use dscm_ad::tape::{Tape, Var};
use dscm_core::{Error, Result};
use nalgebra::DMatrix;
use rand::rngs::StdRng;

use crate::exec::{ExecCtx, Program};
use crate::trace::Trace;

/// Monte Carlo ELBO for guides with reparameterised latent sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceGraphElbo {
    /// Particles per estimate.
    pub num_particles: usize,
}

impl Default for TraceGraphElbo {
    fn default() -> Self {
        Self { num_particles: 1 }
    }
}

impl TraceGraphElbo {
    /// Estimator averaging over `num_particles`.
    pub fn new(num_particles: usize) -> Result<Self> {
        if num_particles == 0 {
            return Err(Error::Validation("num_particles must be positive".to_string()));
        }
        Ok(Self { num_particles })
    }

    /// One ELBO sample and the traces that produced it.
    fn particle(
        &self,
        model: &dyn Program,
        guide: &dyn Program,
        tape: &mut Tape,
        params: &BoundParams,
        rng: &mut StdRng,
    ) -> Result<(Var, Trace, Trace)> {
        let guide_rec = {
            let mut ctx = ExecCtx::new(tape, params, rng);
            guide.run(&mut ctx)?;
            ctx.finish()
        };
        for site in guide_rec.trace.iter().filter(|s| s.is_latent()) {
            if !site.distribution.has_rsample() {
                return Err(Error::Validation(format!(
                    "guide site '{}' is not reparameterisable: {}",
                    site.name, site.distribution
                )));
            }
        }
        let model_rec = {
            let mut ctx = ExecCtx::new(tape, params, rng).with_replay(guide_rec.latent_values().clone());
            model.run(&mut ctx)?;
            ctx.finish()
        };
        let log_p = model_rec.log_joint(tape)?;
        let log_q = guide_rec.log_joint(tape)?;
        let elbo = tape.sub(log_p, log_q)?;
        Ok((elbo, model_rec.trace, guide_rec.trace))
    }

    fn estimate(
        &self,
        model: &dyn Program,
        guide: &dyn Program,
        tape: &mut Tape,
        params: &BoundParams,
        rng: &mut StdRng,
        on_traces: &mut dyn FnMut(Trace, Trace),
    ) -> Result<Var> {
        let mut elbos = Vec::with_capacity(self.num_particles);
        for _ in 0..self.num_particles {
            let (elbo, model_trace, guide_trace) = self.particle(model, guide, tape, params, rng)?;
            on_traces(model_trace, guide_trace);
            elbos.push(elbo);
        }
        let total = tape.sum(&elbos)?;
        Ok(tape.mul_f64(total, -1.0 / self.num_particles as f64))
    }

    /// Loss and one gradient matrix per parameter; `on_traces` sees every
    /// particle's `(model, guide)` trace pair.
    pub fn loss_and_grads_with(
        &self,
        model: &dyn Program,
        guide: &dyn Program,
        params: &ParamStore,
        rng: &mut StdRng,
        on_traces: &mut dyn FnMut(Trace, Trace),
    ) -> Result<(f64, Vec<DMatrix<f64>>)> {
        let mut tape = Tape::new();
        let bound = params.bind(&mut tape);
        let loss = self.estimate(model, guide, &mut tape, &bound, rng, on_traces)?;
        tape.backward(loss);
        Ok((tape.val(loss), bound.gradients(&tape)))
    }

    /// Loss and gradients.
    pub fn loss_and_grads(
        &self,
        model: &dyn Program,
        guide: &dyn Program,
        params: &ParamStore,
        rng: &mut StdRng,
    ) -> Result<(f64, Vec<DMatrix<f64>>)> {
        self.loss_and_grads_with(model, guide, params, rng, &mut |_, _| {})
    }

    /// Loss without gradients.
    pub fn loss_with(
        &self,
        model: &dyn Program,
        guide: &dyn Program,
        params: &ParamStore,
        rng: &mut StdRng,
        on_traces: &mut dyn FnMut(Trace, Trace),
    ) -> Result<f64> {
        let mut tape = Tape::new();
        let bound = params.bind_constant(&mut tape);
        let loss = self.estimate(model, guide, &mut tape, &bound, rng, on_traces)?;
        Ok(tape.val(loss))
    }

    /// Loss without gradients.
    pub fn loss(&self, model: &dyn Program, guide: &dyn Program, params: &ParamStore, rng: &mut StdRng) -> Result<f64> {
        self.loss_with(model, guide, params, rng, &mut |_, _| {})
    }

    /// `(model, guide)` traces of a single particle, without gradients.
    pub fn traces(
        &self,
        model: &dyn Program,
        guide: &dyn Program,
        params: &ParamStore,
        rng: &mut StdRng,
    ) -> Result<(Trace, Trace)> {
        let mut tape = Tape::new();
        let bound = params.bind_constant(&mut tape);
        let (_, model_trace, guide_trace) = self.particle(model, guide, &mut tape, &bound, rng)?;
        Ok((model_trace, guide_trace))
    }
}

/// [`TraceGraphElbo`] that keeps the most recent `(model, guide)` trace pair.
///
/// The loss and gradients are exactly those of the wrapped estimator.
#[derive(Debug, Clone, Default)]
pub struct RetainingElbo {
    inner: TraceGraphElbo,
    last: Option<(Trace, Trace)>,
}

impl RetainingElbo {
    /// Wrap an estimator.
    pub fn new(inner: TraceGraphElbo) -> Self {
        Self { inner, last: None }
    }

    /// The wrapped estimator.
    pub fn inner(&self) -> &TraceGraphElbo {
        &self.inner
    }

    /// Loss and gradients, retaining the last particle's traces.
    pub fn loss_and_grads(
        &mut self,
        model: &dyn Program,
        guide: &dyn Program,
        params: &ParamStore,
        rng: &mut StdRng,
    ) -> Result<(f64, Vec<DMatrix<f64>>)> {
        let last = &mut self.last;
        self.inner.loss_and_grads_with(model, guide, params, rng, &mut |m, g| *last = Some((m, g)))
    }

    /// Loss without gradients, retaining the last particle's traces.
    pub fn loss(
        &mut self,
        model: &dyn Program,
        guide: &dyn Program,
        params: &ParamStore,
        rng: &mut StdRng,
    ) -> Result<f64> {
        let last = &mut self.last;
        self.inner.loss_with(model, guide, params, rng, &mut |m, g| *last = Some((m, g)))
    }

    /// Most recent `(model, guide)` pair.
    pub fn traces(&self) -> Option<(&Trace, &Trace)> {
        self.last.as_ref().map(|(m, g)| (m, g))
    }

    /// Most recent model trace.
    pub fn model_trace(&self) -> Option<&Trace> {
        self.last.as_ref().map(|(m, _)| m)
    }

    /// Most recent guide trace.
    pub fn guide_trace(&self) -> Option<&Trace> {
        self.last.as_ref().map(|(_, g)| g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::Values;
    use approx::assert_relative_eq;
    use dscm_ad::matrix::VarMatrix;
    use dscm_ad::params::ParamId;
    use dscm_prob::Distribution;
    use rand::SeedableRng;

    // z ~ N(0, 1), x | z ~ N(z, 1), observed x = 1.
    fn model(ctx: &mut ExecCtx<'_>) -> Result<()> {
        ctx.observe(&Values::new().with("x", DMatrix::from_element(1, 1, 1.0)));
        let prior = Distribution::standard_normal(ctx.tape(), 1, 1);
        let z = ctx.sample("z", &prior)?;
        let one = VarMatrix::filled(ctx.tape(), 1, 1, 1.0);
        ctx.sample("x", &Distribution::normal(z, one)?)?;
        Ok(())
    }

    struct NormalGuide {
        loc: ParamId,
        log_scale: ParamId,
    }

    impl Program for NormalGuide {
        fn run(&self, ctx: &mut ExecCtx<'_>) -> Result<()> {
            let params = ctx.params();
            let loc = *params.get(self.loc);
            let scale = params.get(self.log_scale).exp(ctx.tape());
            ctx.sample("z", &Distribution::normal(loc, scale)?)?;
            Ok(())
        }
    }

    fn exact_posterior() -> (ParamStore, NormalGuide) {
        let mut store = ParamStore::new();
        let loc = store.register("loc", DMatrix::from_element(1, 1, 0.5)).unwrap();
        let log_scale = store.register("log_scale", DMatrix::from_element(1, 1, 0.5_f64.sqrt().ln())).unwrap();
        (store, NormalGuide { loc, log_scale })
    }

    fn bernoulli_guide(ctx: &mut ExecCtx<'_>) -> Result<()> {
        let logits = VarMatrix::filled(ctx.tape(), 1, 1, 0.0);
        ctx.sample("z", &Distribution::bernoulli(logits))?;
        Ok(())
    }

    #[test]
    fn test_exact_posterior_gives_log_evidence() {
        // log p(x = 1) with x ~ N(0, 2)
        let log_evidence = -0.5 * (2.0 * std::f64::consts::PI * 2.0).ln() - 0.25;
        let (store, guide) = exact_posterior();
        let elbo = TraceGraphElbo::new(3).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let loss = elbo.loss(&model, &guide, &store, &mut rng).unwrap();
        assert_relative_eq!(loss, -log_evidence, epsilon = 1e-10);

        let (loss, grads) = elbo.loss_and_grads(&model, &guide, &store, &mut rng).unwrap();
        assert_relative_eq!(loss, -log_evidence, epsilon = 1e-10);
        assert_eq!(grads.len(), 2);
        assert!(grads.iter().all(|g| g[(0, 0)].is_finite()));
    }

    #[test]
    fn test_gradient_points_towards_posterior() {
        let mut store = ParamStore::new();
        let loc = store.register("loc", DMatrix::from_element(1, 1, -2.0)).unwrap();
        let log_scale = store.register("log_scale", DMatrix::from_element(1, 1, 0.5_f64.sqrt().ln())).unwrap();
        let guide = NormalGuide { loc, log_scale };
        let elbo = TraceGraphElbo::new(64).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (_, grads) = elbo.loss_and_grads(&model, &guide, &store, &mut rng).unwrap();
        // d loss / d loc = (loc - 0.5) / 0.5 in expectation
        assert!(grads[0][(0, 0)] < -3.0, "grad = {}", grads[0][(0, 0)]);
    }

    #[test]
    fn test_non_reparameterised_guide_rejected() {
        let store = ParamStore::new();
        let elbo = TraceGraphElbo::default();
        let mut rng = StdRng::seed_from_u64(1);
        let err = elbo.loss(&model, &bernoulli_guide, &store, &mut rng);
        assert!(matches!(err, Err(Error::Validation(_))));
        assert!(TraceGraphElbo::new(0).is_err());
    }

    #[test]
    fn test_retaining_elbo_keeps_latest_pair() {
        let (store, guide) = exact_posterior();
        let mut elbo = RetainingElbo::new(TraceGraphElbo::new(2).unwrap());
        assert!(elbo.traces().is_none());
        let mut rng = StdRng::seed_from_u64(3);
        let plain = elbo.inner().loss(&model, &guide, &store, &mut StdRng::seed_from_u64(3)).unwrap();
        let loss = elbo.loss(&model, &guide, &store, &mut rng).unwrap();
        assert_relative_eq!(loss, plain, epsilon = 1e-12);

        let (model_trace, guide_trace) = elbo.traces().unwrap();
        assert_eq!(model_trace.names(), vec!["z", "x"]);
        assert!(model_trace.get("x").unwrap().is_observed);
        assert_eq!(guide_trace.names(), vec!["z"]);
        assert_eq!(model_trace.z().unwrap().value, guide_trace.z().unwrap().value);
        assert_eq!(elbo.guide_trace(), Some(guide_trace));
    }
}
