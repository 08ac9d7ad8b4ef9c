//! Abduction, reconstruction and counterfactual queries.
//!
//! The Monte Carlo procedures evaluate the guide once, then draw one seed per
//! particle from the caller's stream and run the particles in parallel. Results
//! are averaged in particle order, so a given seed always gives the same answer.

use std::collections::BTreeMap;

use dscm_ad::params::ParamStore;
use dscm_ad::tape::Tape;
use dscm_core::{Error, Result};
use dscm_prob::DistDescriptor;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::CounterfactualType;
use crate::exec::{ExecCtx, Overrides};
use crate::scm::StructuralCausalModel;
use crate::values::{Observation, ObservedVars, ScmSample, Values, Variable};

/// Posterior `q(z | obs)` evaluated once, without gradients.
pub fn posterior<M>(scm: &M, params: &ParamStore, obs: &Observation) -> Result<DistDescriptor>
where
    M: StructuralCausalModel + ?Sized,
{
    let mut tape = Tape::new();
    let bound = params.bind_constant(&mut tape);
    let observed = ObservedVars::constant(&mut tape, obs);
    let q = scm.infer_posterior(&mut tape, &bound, &observed)?;
    Ok(q.describe(&tape))
}

/// Images must have as many pixels as the model decodes.
fn check_pixels<M>(scm: &M, obs: &Observation) -> Result<()>
where
    M: StructuralCausalModel + ?Sized,
{
    if obs.x.ncols() != scm.num_pixels() {
        return Err(Error::Validation(format!(
            "image has {} pixels, model expects {}",
            obs.x.ncols(),
            scm.num_pixels()
        )));
    }
    Ok(())
}

/// Run the model conditioned on the observation and `z`, and read the base
/// value of every transformed site.
pub fn abduct_exogenous<M>(scm: &M, z: &DMatrix<f64>, obs: &Observation, rng: &mut StdRng) -> Result<Values>
where
    M: StructuralCausalModel + ?Sized,
{
    let mut condition = obs.to_values();
    condition.insert("z", z.clone());
    let mut tape = Tape::new();
    let bound = scm.params().bind_constant(&mut tape);
    let mut ctx = ExecCtx::new(&mut tape, &bound, rng).with_overrides(&Overrides::conditioned(condition));
    scm.model(&mut ctx, obs.batch_size())?;
    let recorded = ctx.finish();

    let mut exogenous = Values::new();
    for (name, base) in recorded.bases() {
        exogenous.insert(name.clone(), base.value(&tape));
    }
    Ok(exogenous)
}

/// Sample `z` from the guide and abduct the exogenous noise; the result holds
/// `z` and every `{name}_base`.
pub fn infer<M>(scm: &M, obs: &Values, rng: &mut StdRng) -> Result<Values>
where
    M: StructuralCausalModel + ?Sized,
{
    let obs = Observation::try_from(obs)?;
    check_pixels(scm, &obs)?;
    let q = posterior(scm, scm.params(), &obs)?;
    let z = q.sample(rng)?;
    let mut exogenous = scm.infer_exogenous(&z, &obs, rng)?;
    exogenous.insert("z", z);
    Ok(exogenous)
}

fn particle_seeds(rng: &mut StdRng, num_particles: usize) -> Result<Vec<u64>> {
    if num_particles == 0 {
        return Err(Error::Validation("num_particles must be positive".to_string()));
    }
    Ok((0..num_particles).map(|_| rng.random::<u64>()).collect())
}

fn mean_matrix(parts: &[DMatrix<f64>]) -> Result<DMatrix<f64>> {
    let Some(first) = parts.first() else {
        return Err(Error::Validation("cannot average zero particles".to_string()));
    };
    let mut acc = DMatrix::zeros(first.nrows(), first.ncols());
    for p in parts {
        acc += p;
    }
    Ok(acc / parts.len() as f64)
}

/// Mean image over `num_particles` decodes of posterior samples, conditioned on
/// the observed covariates.
pub fn reconstruct<M>(scm: &M, obs: &Observation, num_particles: usize, rng: &mut StdRng) -> Result<DMatrix<f64>>
where
    M: StructuralCausalModel + ?Sized,
{
    check_pixels(scm, obs)?;
    let q = posterior(scm, scm.params(), obs)?;
    let seeds = particle_seeds(rng, num_particles)?;
    let images = seeds
        .par_iter()
        .map(|&seed| {
            let mut prng = StdRng::seed_from_u64(seed);
            let z = q.sample(&mut prng)?;
            let condition = obs.covariates().with("z", z);
            let s = scm.sample(obs.batch_size(), &Overrides::conditioned(condition), &mut prng)?;
            Ok(s.x)
        })
        .collect::<Result<Vec<_>>>()?;
    mean_matrix(&images)
}

/// Answer "what would the observation have been under `condition`".
///
/// Abduction recovers `z` and the exogenous noise per particle, the action
/// replaces exactly the variables named in `condition`, and prediction re-runs
/// the mechanisms forward. `sex` keeps its observed value unless `condition`
/// names it.
pub fn counterfactual<M>(
    scm: &M,
    obs: &Values,
    condition: &Values,
    num_particles: usize,
    rng: &mut StdRng,
) -> Result<ScmSample>
where
    M: StructuralCausalModel + ?Sized,
{
    let obs = Observation::try_from(obs)?;
    check_pixels(scm, &obs)?;
    for (name, _) in condition.iter() {
        name.parse::<Variable>()?;
    }
    let q = posterior(scm, scm.params(), &obs)?;
    let seeds = particle_seeds(rng, num_particles)?;
    let samples = seeds
        .par_iter()
        .map(|&seed| {
            let mut prng = StdRng::seed_from_u64(seed);
            let z = q.sample(&mut prng)?;
            let mut exogenous = scm.infer_exogenous(&z, &obs, &mut prng)?;
            exogenous.insert("z", z);
            if !condition.contains(Variable::Sex.name()) {
                exogenous.insert(Variable::Sex.name(), obs.sex.clone());
            }
            let overrides = Overrides { condition: exogenous, intervene: condition.clone() };
            Ok(scm.sample_scm(obs.batch_size(), &overrides, &mut prng)?.0)
        })
        .collect::<Result<Vec<_>>>()?;
    ScmSample::mean(&samples)
}

/// Guide over `z` evaluated on a counterfactual of the batch.
///
/// `z₀` is drawn from the posterior of the batch, the image noise is abducted
/// under `z₀`, the selected volumes are permuted across the batch, and the
/// counterfactual image is predicted from the abducted noise. The `z` site is
/// then sampled from the posterior of the counterfactual. Only `z` is recorded;
/// gradients flow through the whole path. A `Random` type not already fixed for
/// the batch is drawn here.
pub fn counterfactual_guide<M>(
    scm: &M,
    ctx: &mut ExecCtx<'_>,
    obs: &Observation,
    cf_type: CounterfactualType,
) -> Result<()>
where
    M: StructuralCausalModel + ?Sized,
{
    let n = obs.batch_size();
    ctx.enter_plate(n);
    let cf_type = cf_type.resolve(ctx.rng());
    let params = ctx.params();
    let observed = ObservedVars::constant(ctx.tape(), obs);

    let q0 = scm.infer_posterior(ctx.tape(), params, &observed)?;
    let z0 = {
        let (tape, rng) = ctx.tape_and_rng();
        q0.rsample(tape, rng)?
    };

    let mut replay = {
        let mut abduction = ctx
            .child()
            .with_overrides(&Overrides::conditioned(obs.to_values()))
            .with_replay(BTreeMap::from([("z".to_string(), z0)]));
        scm.model(&mut abduction, n)?;
        abduction.finish().bases().clone()
    };
    replay.insert("z".to_string(), z0);

    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(ctx.rng());

    let mut actions = Vec::with_capacity(2);
    if cf_type.perturbs_ventricle_volume() {
        actions.push((Variable::VentricleVolume, observed.ventricle_volume.select_rows(ctx.tape(), &perm)?));
    }
    if cf_type.perturbs_brain_volume() {
        actions.push((Variable::BrainVolume, observed.brain_volume.select_rows(ctx.tape(), &perm)?));
    }

    let mut prediction = ctx.child().reparameterized().with_replay(replay).condition_on("sex", observed.sex);
    for (v, value) in actions {
        prediction = prediction.intervene_on(v.name(), value);
    }
    let cf = scm.model(&mut prediction, n)?;

    let cf_observed = ObservedVars {
        x: cf.x,
        sex: cf.sex,
        age: cf.age,
        ventricle_volume: cf.ventricle_volume,
        brain_volume: cf.brain_volume,
    };
    let q = scm.infer_posterior(ctx.tape(), params, &cf_observed)?;
    ctx.sample(Variable::Z.name(), &q)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScmConfig, ScmKind};
    use crate::scm::build_scm;
    use approx::assert_relative_eq;

    fn tiny() -> ScmConfig {
        ScmConfig {
            kind: ScmKind::Conditional,
            latent_dim: 2,
            enc_filters: "4".to_string(),
            dec_filters: "4".to_string(),
            num_convolutions: 1,
            image_height: 2,
            image_width: 2,
            flow_hidden: vec![3],
            init_seed: 5,
            ..ScmConfig::default()
        }
    }

    #[test]
    fn test_abduction_recovers_noise_used_for_sampling() {
        let scm = build_scm(&tiny()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let (s, trace) = scm.sample_scm(3, &Overrides::new(), &mut rng).unwrap();
        let obs = s.observation().unwrap();
        let exo = scm.infer_exogenous(&s.z, &obs, &mut rng).unwrap();
        for name in ["age_base", "brain_volume_base", "ventricle_volume_base", "x_base"] {
            let expected = &trace.site(name).unwrap().value;
            let got = exo.get(name).unwrap();
            for (a, b) in got.iter().zip(expected.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-6);
            }
        }
        assert!(exo.get("sex_base").is_none());
    }

    #[test]
    fn test_counterfactual_rejects_unknown_condition() {
        let scm = build_scm(&tiny()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let s = scm.sample(2, &Overrides::new(), &mut rng).unwrap();
        let obs = s.observation().unwrap().to_values();
        let bad = Values::new().with("height", DMatrix::zeros(1, 1));
        assert!(matches!(scm.counterfactual(&obs, &bad, 2, &mut rng), Err(Error::Validation(_))));
        assert!(scm.reconstruct(&s.observation().unwrap(), 0, &mut rng).is_err());
    }

    #[test]
    fn test_counterfactual_guide_records_only_z() {
        let scm = build_scm(&tiny()).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let s = scm.sample(4, &Overrides::new(), &mut rng).unwrap();
        let obs = s.observation().unwrap();
        for cf_type in [CounterfactualType::Random, CounterfactualType::Both] {
            let mut tape = Tape::new();
            let bound = scm.params().bind(&mut tape);
            let mut ctx = ExecCtx::new(&mut tape, &bound, &mut rng);
            scm.counterfactual_guide(&mut ctx, &obs, cf_type).unwrap();
            let recorded = ctx.finish();
            assert_eq!(recorded.trace.names(), vec!["z"]);
            assert_eq!(recorded.trace.z().unwrap().value.shape(), (4, 2));
        }
    }
}
