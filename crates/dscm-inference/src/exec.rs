//! Explicit execution context for generative programs.
//!
//! Models and guides are plain functions of an [`ExecCtx`]. Every random
//! choice goes through [`ExecCtx::sample`], which resolves the site's value
//! from, in order:
//!
//! 1. an intervention (`do`): the value is fixed and the mechanism is skipped;
//! 2. a replayed value (a guide sample fed into the model): scored, latent;
//! 3. a conditioned value (data): scored, observed;
//! 4. with reparameterisation enabled, a transformed distribution is split into
//!    an explicit `{name}_base` noise site followed by a deterministic site;
//! 5. otherwise a fresh draw.
//!
//! The recorded sites are returned by [`ExecCtx::finish`] as [`Recorded`],
//! which keeps the tape variables needed for the objective next to the `f64`
//! [`Trace`].

use std::collections::BTreeMap;

use dscm_ad::matrix::VarMatrix;
use dscm_ad::params::BoundParams;
use dscm_ad::tape::{Tape, Var};
use dscm_core::{Error, Result};
use dscm_prob::{DistDescriptor, Distribution};
use nalgebra::DVector;
use rand::rngs::StdRng;

use crate::trace::{Site, SiteKind, Trace};
use crate::values::Values;

/// Conditioning and intervention applied to one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    /// Observed values; the site is scored at this value.
    pub condition: Values,
    /// Intervened values; the site's mechanism is replaced by the value.
    pub intervene: Values,
}

impl Overrides {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Condition on `values`.
    pub fn conditioned(values: Values) -> Self {
        Self { condition: values, intervene: Values::new() }
    }

    /// Intervene with `values`.
    pub fn intervened(values: Values) -> Self {
        Self { condition: Values::new(), intervene: values }
    }

    /// Whether nothing is overridden.
    pub fn is_empty(&self) -> bool {
        self.condition.is_empty() && self.intervene.is_empty()
    }
}

/// State threaded through one execution of a model or guide.
pub struct ExecCtx<'a> {
    tape: &'a mut Tape,
    params: &'a BoundParams,
    rng: &'a mut StdRng,
    condition: BTreeMap<String, VarMatrix>,
    intervene: BTreeMap<String, VarMatrix>,
    replay: BTreeMap<String, VarMatrix>,
    reparam: bool,
    plate: Option<usize>,
    recorded: Recorded,
}

impl<'a> ExecCtx<'a> {
    /// Fresh context with no overrides.
    pub fn new(tape: &'a mut Tape, params: &'a BoundParams, rng: &'a mut StdRng) -> Self {
        Self {
            tape,
            params,
            rng,
            condition: BTreeMap::new(),
            intervene: BTreeMap::new(),
            replay: BTreeMap::new(),
            reparam: false,
            plate: None,
            recorded: Recorded::default(),
        }
    }

    /// Apply `overrides`, recording their values as constants.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        self.observe(&overrides.condition);
        for (name, v) in overrides.intervene.iter() {
            let m = VarMatrix::constant(self.tape, v);
            self.intervene.insert(name.to_string(), m);
        }
        self
    }

    /// Condition a site on a tape value.
    pub fn condition_on(mut self, name: impl Into<String>, value: VarMatrix) -> Self {
        self.condition.insert(name.into(), value);
        self
    }

    /// Intervene on a site with a tape value.
    pub fn intervene_on(mut self, name: impl Into<String>, value: VarMatrix) -> Self {
        self.intervene.insert(name.into(), value);
        self
    }

    /// Replay latent values (scored as unobserved).
    pub fn with_replay(mut self, values: BTreeMap<String, VarMatrix>) -> Self {
        self.replay.extend(values);
        self
    }

    /// Expose the base noise of transformed sites as explicit `{name}_base` sites.
    pub fn reparameterized(mut self) -> Self {
        self.reparam = true;
        self
    }

    /// Condition on data from inside a program.
    pub fn observe(&mut self, values: &Values) {
        for (name, v) in values.iter() {
            let m = VarMatrix::constant(self.tape, v);
            self.condition.insert(name.to_string(), m);
        }
    }

    /// Require every site to have `n` batch rows.
    pub fn enter_plate(&mut self, n: usize) {
        self.plate = Some(n);
    }

    /// Bound parameters.
    pub fn params(&self) -> &'a BoundParams {
        self.params
    }

    /// The tape.
    pub fn tape(&mut self) -> &mut Tape {
        &mut *self.tape
    }

    /// The random stream.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut *self.rng
    }

    /// The tape and the random stream together.
    pub fn tape_and_rng(&mut self) -> (&mut Tape, &mut StdRng) {
        (&mut *self.tape, &mut *self.rng)
    }

    /// A nested context on the same tape and stream. Its sites are not part of
    /// this context's trace.
    pub fn child(&mut self) -> ExecCtx<'_> {
        ExecCtx::new(&mut *self.tape, self.params, &mut *self.rng)
    }

    /// Record a random choice and return its value.
    pub fn sample(&mut self, name: &str, dist: &Distribution) -> Result<VarMatrix> {
        let shape = dist.shape();
        if let Some(n) = self.plate {
            if shape.0 != n {
                return Err(Error::Validation(format!(
                    "site '{name}' has {} rows inside a plate of size {n}",
                    shape.0
                )));
            }
        }

        if let Some(v) = self.intervene.get(name).copied() {
            let value = fit_rows(self.tape, name, v, shape)?;
            self.record(name, SiteKind::Intervened, &value, DistDescriptor::Delta, None, None, false)?;
            return Ok(value);
        }
        if let Some(v) = self.replay.get(name).copied() {
            let value = fit_rows(self.tape, name, v, shape)?;
            let (lp, base) = dist.log_prob_with_base(self.tape, &value)?;
            let desc = dist.describe(self.tape);
            self.record(name, SiteKind::Sample, &value, desc, Some(lp), base, false)?;
            return Ok(value);
        }
        if let Some(v) = self.condition.get(name).copied() {
            let value = fit_rows(self.tape, name, v, shape)?;
            let (lp, base) = dist.log_prob_with_base(self.tape, &value)?;
            let desc = dist.describe(self.tape);
            self.record(name, SiteKind::Sample, &value, desc, Some(lp), base, true)?;
            return Ok(value);
        }
        if let (true, Distribution::Transformed { base, transforms }) = (self.reparam, dist) {
            let noise = self.sample(&format!("{name}_base"), base)?;
            let value = transforms.forward(self.tape, &noise)?;
            let desc = dist.describe(self.tape);
            self.record(name, SiteKind::Deterministic, &value, desc, None, Some(noise), false)?;
            return Ok(value);
        }

        let (value, lp, base) = dist.rsample_with_log_prob(self.tape, &mut *self.rng)?;
        let desc = dist.describe(self.tape);
        self.record(name, SiteKind::Sample, &value, desc, Some(lp), base, false)?;
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        name: &str,
        kind: SiteKind,
        value: &VarMatrix,
        distribution: DistDescriptor,
        log_prob: Option<VarMatrix>,
        base: Option<VarMatrix>,
        is_observed: bool,
    ) -> Result<()> {
        let n = value.nrows();
        let (rows, total) = match &log_prob {
            Some(lp) => {
                let rows = lp.row_sums(self.tape);
                let total = rows.sum(self.tape);
                (Some(rows), Some(total))
            }
            None => (None, None),
        };
        let log_prob = match rows {
            Some(r) => DVector::from_column_slice(self.tape.value(r.var()).as_slice()),
            None => DVector::zeros(n),
        };
        let site = Site {
            name: name.to_string(),
            kind,
            value: value.value(self.tape),
            distribution,
            log_prob_sum: total.map_or(0.0, |v| self.tape.val(v)),
            log_prob,
            is_observed,
            base_value: base.as_ref().map(|b| b.value(self.tape)),
        };
        self.recorded.trace.push(site)?;

        if let (SiteKind::Sample, Some(total)) = (kind, total) {
            self.recorded.scored.push(total);
        }
        if kind == SiteKind::Sample && !is_observed {
            self.recorded.latent.insert(name.to_string(), *value);
        }
        if let Some(b) = base {
            self.recorded.bases.insert(format!("{name}_base"), b);
        }
        self.recorded.values.insert(name.to_string(), *value);
        Ok(())
    }

    /// End the execution and hand back what was recorded.
    pub fn finish(self) -> Recorded {
        self.recorded
    }
}

/// A generative program: a model or a guide bound to its arguments.
pub trait Program {
    /// Execute once against `ctx`.
    fn run(&self, ctx: &mut ExecCtx<'_>) -> Result<()>;
}

impl<F> Program for F
where
    F: Fn(&mut ExecCtx<'_>) -> Result<()>,
{
    fn run(&self, ctx: &mut ExecCtx<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Broadcast a single-row override to the site's batch size.
fn fit_rows(tape: &mut Tape, name: &str, value: VarMatrix, shape: (usize, usize)) -> Result<VarMatrix> {
    let (n, d) = shape;
    if value.shape() == shape {
        return Ok(value);
    }
    if value.nrows() == 1 && value.ncols() == d {
        return value.repeat_rows(tape, n);
    }
    Err(Error::Validation(format!(
        "value for site '{name}' has shape {:?}, expected {:?}",
        value.shape(),
        shape
    )))
}

/// Sites recorded by one execution, with their tape variables.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// `f64` snapshot of the sites.
    pub trace: Trace,
    values: BTreeMap<String, VarMatrix>,
    latent: BTreeMap<String, VarMatrix>,
    bases: BTreeMap<String, VarMatrix>,
    scored: Vec<Var>,
}

impl Recorded {
    /// Tape value of a site.
    pub fn value(&self, name: &str) -> Result<&VarMatrix> {
        self.values
            .get(name)
            .ok_or_else(|| Error::Validation(format!("no site '{name}' was recorded")))
    }

    /// Unobserved sampled sites, ready to be replayed into another program.
    pub fn latent_values(&self) -> &BTreeMap<String, VarMatrix> {
        &self.latent
    }

    /// Base noise of transformed sites, keyed `{name}_base`.
    pub fn bases(&self) -> &BTreeMap<String, VarMatrix> {
        &self.bases
    }

    /// Joint log-density of all scored sites.
    pub fn log_joint(&self, tape: &mut Tape) -> Result<Var> {
        tape.sum(&self.scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dscm_ad::params::ParamStore;
    use dscm_prob::{Transform, TransformChain};
    use nalgebra::DMatrix;
    use rand::SeedableRng;

    fn lognormal(tape: &mut Tape, n: usize) -> Distribution {
        let base = Distribution::standard_normal(tape, n, 1);
        let chain = TransformChain::new(vec![
            Transform::affine_const(tape, 1.0, 0.5).unwrap(),
            Transform::Exp,
        ]);
        Distribution::transformed(base, chain)
    }

    #[test]
    fn test_fresh_sample_is_latent_and_scored() {
        let store = ParamStore::new();
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let mut rng = StdRng::seed_from_u64(42);
        let mut ctx = ExecCtx::new(&mut tape, &bound, &mut rng);
        let d = lognormal(ctx.tape(), 3);
        let v = ctx.sample("age", &d).unwrap();
        assert_eq!(v.shape(), (3, 1));
        let rec = ctx.finish();

        let site = rec.trace.age().unwrap();
        assert_eq!(site.kind, SiteKind::Sample);
        assert!(site.is_latent());
        assert!(rec.latent_values().contains_key("age"));
        let base = rec.bases().get("age_base").unwrap();
        let joint = rec.log_joint(&mut tape).unwrap();
        assert_relative_eq!(tape.val(joint), site.log_prob_sum, epsilon = 1e-12);
        // value = exp(1 + 0.5 * base)
        let b = base.value(&tape)[(0, 0)];
        assert_relative_eq!(site.value[(0, 0)], (1.0 + 0.5 * b).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_condition_recovers_base() {
        let store = ParamStore::new();
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let mut rng = StdRng::seed_from_u64(1);
        let obs = Values::new().with("age", DMatrix::from_element(2, 1, 1.0_f64.exp()));
        let mut ctx = ExecCtx::new(&mut tape, &bound, &mut rng).with_overrides(&Overrides::conditioned(obs));
        let d = lognormal(ctx.tape(), 2);
        ctx.sample("age", &d).unwrap();
        let rec = ctx.finish();
        let site = rec.trace.age().unwrap();
        assert!(site.is_observed);
        assert!(rec.latent_values().is_empty());
        let base = site.base_value.as_ref().unwrap();
        assert_relative_eq!(base[(1, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_intervention_skips_mechanism_and_broadcasts() {
        let store = ParamStore::new();
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let mut rng = StdRng::seed_from_u64(2);
        let fixed = Values::new().with("age", DMatrix::from_element(1, 1, 50.0));
        let mut ctx = ExecCtx::new(&mut tape, &bound, &mut rng).with_overrides(&Overrides::intervened(fixed));
        let d = lognormal(ctx.tape(), 4);
        let v = ctx.sample("age", &d).unwrap();
        assert_eq!(v.shape(), (4, 1));
        let rec = ctx.finish();
        let site = rec.trace.age().unwrap();
        assert_eq!(site.kind, SiteKind::Intervened);
        assert_eq!(site.distribution, DistDescriptor::Delta);
        assert_eq!(site.value, DMatrix::from_element(4, 1, 50.0));
        let joint = rec.log_joint(&mut tape).unwrap();
        assert_relative_eq!(tape.val(joint), 0.0);
    }

    #[test]
    fn test_reparameterized_exposes_base_site() {
        let store = ParamStore::new();
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let mut rng = StdRng::seed_from_u64(3);
        let noise = Values::new().with("age_base", DMatrix::from_element(2, 1, 2.0));
        let mut ctx = ExecCtx::new(&mut tape, &bound, &mut rng)
            .with_overrides(&Overrides::conditioned(noise))
            .reparameterized();
        let d = lognormal(ctx.tape(), 2);
        ctx.sample("age", &d).unwrap();
        let rec = ctx.finish();
        assert_eq!(rec.trace.names(), vec!["age_base", "age"]);
        assert_eq!(rec.trace.age().unwrap().kind, SiteKind::Deterministic);
        assert_relative_eq!(rec.trace.age().unwrap().value[(0, 0)], 2.0_f64.exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_plate_and_shape_checks() {
        let store = ParamStore::new();
        let mut tape = Tape::new();
        let bound = store.bind(&mut tape);
        let mut rng = StdRng::seed_from_u64(4);
        let bad = Values::new().with("age", DMatrix::from_element(3, 2, 1.0));
        let mut ctx = ExecCtx::new(&mut tape, &bound, &mut rng).with_overrides(&Overrides::conditioned(bad));
        ctx.enter_plate(2);
        let d = lognormal(ctx.tape(), 3);
        assert!(ctx.sample("age", &d).is_err());
        let d = lognormal(ctx.tape(), 2);
        assert!(ctx.sample("age", &d).is_err());
    }
}
