//! Variational image SCM variants.
//!
//! Both variants share the latent code, the sex prior, the image mechanism and
//! the posterior network ([`VisemBase`]); they differ in how the continuous
//! covariates depend on each other.
//!
//! Image mechanism, with `α = 0.05`:
//!
//! ```text
//! x = 256 · (sigmoid(loc(z, vv_, bv_) + exp(logstd) · x_base) − α) / (1 − α)
//! ```
//!
//! where `vv_` and `bv_` are the log-normalised volumes.

use dscm_ad::matrix::VarMatrix;
use dscm_ad::params::{BoundParams, ParamId, ParamStore};
use dscm_ad::tape::Tape;
use dscm_core::Result;
use dscm_prob::{Distribution, Transform, TransformChain};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::{CovariateNormalization, ScmConfig, ScmKind};
use crate::counterfactual::abduct_exogenous;
use crate::exec::ExecCtx;
use crate::flows::{AffineFlow, ConditionalAffineFlow, CovariateMechanism, flow_param};
use crate::nn::{DenseNet, ImageDecoder, ImageEncoder, IndependentNormalHead};
use crate::scm::StructuralCausalModel;
use crate::values::{Observation, ObservedVars, ScmVars, Values};

/// Lower bound of the image sigmoid range before rescaling.
pub const IMAGE_ALPHA: f64 = 0.05;
/// Intensity range of the images.
pub const IMAGE_RANGE: f64 = 256.0;

/// `[Sigmoid, Affine]` mapping logits to intensities in `[0, 256)`.
fn image_output_transforms(tape: &mut Tape) -> Result<Vec<Transform>> {
    let scale = IMAGE_RANGE / (1.0 - IMAGE_ALPHA);
    Ok(vec![Transform::Sigmoid, Transform::affine_const(tape, -IMAGE_ALPHA * scale, scale)?])
}

/// Components shared by every variant.
#[derive(Debug, Clone)]
pub struct VisemBase {
    latent_dim: usize,
    num_pixels: usize,
    norm: CovariateNormalization,
    sex_logits: ParamId,
    encoder: ImageEncoder,
    latent_layer: DenseNet,
    latent_head: IndependentNormalHead,
    decoder: ImageDecoder,
}

impl VisemBase {
    /// Register the shared parameters.
    pub fn new(store: &mut ParamStore, cfg: &ScmConfig, rng: &mut StdRng) -> Result<Self> {
        let num_pixels = cfg.num_pixels();
        let sex_logits = store.register(flow_param("sex_logits"), DMatrix::zeros(1, 1))?;
        let encoder = ImageEncoder::new(store, num_pixels, &cfg.enc_widths()?, cfg.num_convolutions, rng)?;
        let hidden = encoder.out_dim();
        let latent_layer = DenseNet::new(store, "latent_layer", hidden + 2, &[hidden], true, rng)?;
        let latent_head = IndependentNormalHead::new(store, "latent_head", hidden, cfg.latent_dim, rng)?;
        let decoder = ImageDecoder::new(
            store,
            cfg.latent_dim + 2,
            cfg.image_height,
            cfg.image_width,
            &cfg.dec_widths()?,
            cfg.num_convolutions,
            cfg.use_upconv,
            cfg.logstd_init,
            rng,
        )?;
        Ok(Self {
            latent_dim: cfg.latent_dim,
            num_pixels,
            norm: cfg.normalization,
            sex_logits,
            encoder,
            latent_layer,
            latent_head,
            decoder,
        })
    }

    /// `sex ~ Bernoulli(sex_logits)`
    fn sex_distribution(&self, tape: &mut Tape, params: &BoundParams, n: usize) -> Result<Distribution> {
        Ok(Distribution::bernoulli(params.get(self.sex_logits).repeat_rows(tape, n)?))
    }

    /// Sample `z ~ N(0, I)`.
    fn sample_z(&self, ctx: &mut ExecCtx<'_>, n: usize) -> Result<VarMatrix> {
        let prior = Distribution::standard_normal(ctx.tape(), n, self.latent_dim);
        ctx.sample("z", &prior)
    }

    /// Image distribution given `z` and the volumes.
    fn image_distribution(
        &self,
        tape: &mut Tape,
        params: &BoundParams,
        z: &VarMatrix,
        ventricle_volume: &VarMatrix,
        brain_volume: &VarMatrix,
    ) -> Result<Distribution> {
        let vv_ = self.norm.ventricle_volume.normalize(tape, ventricle_volume);
        let bv_ = self.norm.brain_volume.normalize(tape, brain_volume);
        let h = VarMatrix::hcat(tape, &[z, &vv_, &bv_])?;
        let loc = self.decoder.forward(tape, params, &h)?;
        let scale = self.decoder.scale(tape, params);
        let mut parts = vec![Transform::affine(loc, scale)];
        parts.extend(image_output_transforms(tape)?);
        let base = Distribution::standard_normal(tape, z.nrows(), self.num_pixels);
        Ok(Distribution::transformed(base, TransformChain::new(parts)))
    }

    /// Sample the image site.
    fn sample_x(
        &self,
        ctx: &mut ExecCtx<'_>,
        z: &VarMatrix,
        ventricle_volume: &VarMatrix,
        brain_volume: &VarMatrix,
    ) -> Result<VarMatrix> {
        let params = ctx.params();
        let dist = self.image_distribution(ctx.tape(), params, z, ventricle_volume, brain_volume)?;
        ctx.sample("x", &dist)
    }

    /// `q(z | x, vv_, bv_)` from the logit-space image.
    fn infer_posterior(&self, tape: &mut Tape, params: &BoundParams, obs: &ObservedVars) -> Result<Distribution> {
        let logits = TransformChain::new(image_output_transforms(tape)?).inverse(tape, &obs.x)?;
        let h = self.encoder.forward(tape, params, &logits)?;
        let vv_ = self.norm.ventricle_volume.normalize(tape, &obs.ventricle_volume);
        let bv_ = self.norm.brain_volume.normalize(tape, &obs.brain_volume);
        let h = VarMatrix::hcat(tape, &[&h, &vv_, &bv_])?;
        let h = self.latent_layer.forward(tape, params, &h)?;
        self.latent_head.forward(tape, params, &h)
    }
}

/// Covariates drawn independently of each other.
#[derive(Debug, Clone)]
pub struct IndependentVisem {
    base: VisemBase,
    age: CovariateMechanism,
    brain_volume: CovariateMechanism,
    ventricle_volume: CovariateMechanism,
    params: ParamStore,
}

impl IndependentVisem {
    /// Build and initialise from `cfg.init_seed`.
    pub fn new(cfg: &ScmConfig) -> Result<Self> {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(cfg.init_seed);
        let base = VisemBase::new(&mut store, cfg, &mut rng)?;
        let age = CovariateMechanism::Unconditional(AffineFlow::new(&mut store, "age")?);
        let brain_volume = CovariateMechanism::Unconditional(AffineFlow::new(&mut store, "brain_volume")?);
        let ventricle_volume = CovariateMechanism::Unconditional(AffineFlow::new(&mut store, "ventricle_volume")?);
        Ok(Self { base, age, brain_volume, ventricle_volume, params: store })
    }
}

impl StructuralCausalModel for IndependentVisem {
    fn kind(&self) -> ScmKind {
        ScmKind::Independent
    }

    fn latent_dim(&self) -> usize {
        self.base.latent_dim
    }

    fn num_pixels(&self) -> usize {
        self.base.num_pixels
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn model(&self, ctx: &mut ExecCtx<'_>, n: usize) -> Result<ScmVars> {
        let p = ctx.params();
        let norm = self.base.norm;

        let d = self.base.sex_distribution(ctx.tape(), p, n)?;
        let sex = ctx.sample("sex", &d)?;
        let d = self.age.distribution(ctx.tape(), p, n, None, &norm.age)?;
        let age = ctx.sample("age", &d)?;
        let d = self.brain_volume.distribution(ctx.tape(), p, n, None, &norm.brain_volume)?;
        let brain_volume = ctx.sample("brain_volume", &d)?;
        let d = self.ventricle_volume.distribution(ctx.tape(), p, n, None, &norm.ventricle_volume)?;
        let ventricle_volume = ctx.sample("ventricle_volume", &d)?;

        let z = self.base.sample_z(ctx, n)?;
        let x = self.base.sample_x(ctx, &z, &ventricle_volume, &brain_volume)?;
        Ok(ScmVars { x, z, sex, age, ventricle_volume, brain_volume })
    }

    fn infer_posterior(&self, tape: &mut Tape, params: &BoundParams, obs: &ObservedVars) -> Result<Distribution> {
        self.base.infer_posterior(tape, params, obs)
    }

    fn infer_exogenous(&self, z: &DMatrix<f64>, obs: &Observation, rng: &mut StdRng) -> Result<Values> {
        abduct_exogenous(self, z, obs, rng)
    }
}

/// `brain_volume` depends on `(sex, age)` and `ventricle_volume` on `(age, brain_volume)`.
#[derive(Debug, Clone)]
pub struct ConditionalVisem {
    base: VisemBase,
    age: CovariateMechanism,
    brain_volume: CovariateMechanism,
    ventricle_volume: CovariateMechanism,
    params: ParamStore,
}

impl ConditionalVisem {
    /// Build and initialise from `cfg.init_seed`.
    pub fn new(cfg: &ScmConfig) -> Result<Self> {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(cfg.init_seed);
        let base = VisemBase::new(&mut store, cfg, &mut rng)?;
        let age = CovariateMechanism::Unconditional(AffineFlow::new(&mut store, "age")?);
        let brain_volume = CovariateMechanism::Conditional(ConditionalAffineFlow::new(
            &mut store,
            "brain_volume",
            2,
            &cfg.flow_hidden,
            &mut rng,
        )?);
        let ventricle_volume = CovariateMechanism::Conditional(ConditionalAffineFlow::new(
            &mut store,
            "ventricle_volume",
            2,
            &cfg.flow_hidden,
            &mut rng,
        )?);
        Ok(Self { base, age, brain_volume, ventricle_volume, params: store })
    }
}

impl StructuralCausalModel for ConditionalVisem {
    fn kind(&self) -> ScmKind {
        ScmKind::Conditional
    }

    fn latent_dim(&self) -> usize {
        self.base.latent_dim
    }

    fn num_pixels(&self) -> usize {
        self.base.num_pixels
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn model(&self, ctx: &mut ExecCtx<'_>, n: usize) -> Result<ScmVars> {
        let p = ctx.params();
        let norm = self.base.norm;

        let d = self.base.sex_distribution(ctx.tape(), p, n)?;
        let sex = ctx.sample("sex", &d)?;

        let d = self.age.distribution(ctx.tape(), p, n, None, &norm.age)?;
        let age = ctx.sample("age", &d)?;
        let age_ = norm.age.normalize(ctx.tape(), &age);

        let parents = VarMatrix::hcat(ctx.tape(), &[&sex, &age_])?;
        let d = self.brain_volume.distribution(ctx.tape(), p, n, Some(&parents), &norm.brain_volume)?;
        let brain_volume = ctx.sample("brain_volume", &d)?;
        let brain_volume_ = norm.brain_volume.normalize(ctx.tape(), &brain_volume);

        let parents = VarMatrix::hcat(ctx.tape(), &[&age_, &brain_volume_])?;
        let d = self.ventricle_volume.distribution(ctx.tape(), p, n, Some(&parents), &norm.ventricle_volume)?;
        let ventricle_volume = ctx.sample("ventricle_volume", &d)?;

        let z = self.base.sample_z(ctx, n)?;
        let x = self.base.sample_x(ctx, &z, &ventricle_volume, &brain_volume)?;
        Ok(ScmVars { x, z, sex, age, ventricle_volume, brain_volume })
    }

    fn infer_posterior(&self, tape: &mut Tape, params: &BoundParams, obs: &ObservedVars) -> Result<Distribution> {
        self.base.infer_posterior(tape, params, obs)
    }

    fn infer_exogenous(&self, z: &DMatrix<f64>, obs: &Observation, rng: &mut StdRng) -> Result<Values> {
        abduct_exogenous(self, z, obs, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Overrides;
    use crate::trace::SiteKind;
    use approx::assert_relative_eq;

    fn tiny(kind: ScmKind) -> ScmConfig {
        ScmConfig {
            kind,
            latent_dim: 3,
            enc_filters: "6,4".to_string(),
            dec_filters: "4,6".to_string(),
            num_convolutions: 1,
            image_height: 4,
            image_width: 4,
            flow_hidden: vec![4],
            init_seed: 42,
            ..ScmConfig::default()
        }
    }

    #[test]
    fn test_site_order_and_shapes() {
        for kind in [ScmKind::Independent, ScmKind::Conditional] {
            let scm = crate::scm::build_scm(&tiny(kind)).unwrap();
            assert_eq!(scm.kind(), kind);
            let mut rng = StdRng::seed_from_u64(42);
            let (s, trace) = scm.generate(5, &Overrides::new(), false, &mut rng).unwrap();
            assert_eq!(trace.names(), vec!["sex", "age", "brain_volume", "ventricle_volume", "z", "x"]);
            assert_eq!(s.x.shape(), (5, 16));
            assert_eq!(s.z.shape(), (5, 3));
            assert!(s.sex.iter().all(|&v| v == 0.0 || v == 1.0));
            assert!(s.age.iter().all(|&v| v > 0.0));
            assert!(s.x.iter().all(|&v| v > -14.0 && v < IMAGE_RANGE));
        }
    }

    #[test]
    fn test_sample_scm_exposes_bases() {
        let scm = ConditionalVisem::new(&tiny(ScmKind::Conditional)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let (_, trace) = scm.sample_scm(2, &Overrides::new(), &mut rng).unwrap();
        assert_eq!(
            trace.names(),
            vec![
                "sex",
                "age_base",
                "age",
                "brain_volume_base",
                "brain_volume",
                "ventricle_volume_base",
                "ventricle_volume",
                "z",
                "x_base",
                "x",
            ]
        );
        assert_eq!(trace.x().unwrap().kind, SiteKind::Deterministic);
    }

    #[test]
    fn test_flow_parameters_grouped() {
        let scm = ConditionalVisem::new(&tiny(ScmKind::Conditional)).unwrap();
        let names = scm.params().names();
        assert!(names.contains(&"flow_components.sex_logits".to_string()));
        assert!(names.iter().any(|n| n.starts_with("flow_components.ventricle_volume.")));
        assert!(names.iter().any(|n| n.starts_with("encoder.")));
        assert!(names.contains(&"decoder.logstd".to_string()));
    }

    #[test]
    fn test_image_transform_formula() {
        let mut tape = Tape::new();
        let chain = TransformChain::new(image_output_transforms(&mut tape).unwrap());
        let v = VarMatrix::constant(&mut tape, &DMatrix::from_element(1, 1, 0.3));
        let y = chain.forward(&mut tape, &v).unwrap();
        let s = 1.0 / (1.0 + (-0.3_f64).exp());
        assert_relative_eq!(y.value(&tape)[(0, 0)], 256.0 * (s - 0.05) / 0.95, epsilon = 1e-10);
    }
}
