//! Training, validation and test steps over raw batches.

use dscm_core::{Error, Metrics, Result, StepOutput};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ExperimentConfig;
use crate::diagnostics::{log_trace_updates, trace_metrics};
use crate::elbo::TraceGraphElbo;
use crate::scm::{GuideKind, StructuralCausalModel, SviGuide, SviModel, build_scm};
use crate::svi::Svi;
use crate::values::{Observation, RawBatch, ScmSample, Values};

/// Full-range intensity of a preprocessed image.
pub const PIXEL_SCALE: f64 = 255.0;

fn column(v: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(v.len(), 1, v.as_slice())
}

/// Owns the SVI driver and the random stream of a run.
#[derive(Debug)]
pub struct SviExperiment {
    config: ExperimentConfig,
    svi: Svi,
    rng: StdRng,
    /// Epoch counter maintained by the harness; only used in messages.
    pub current_epoch: usize,
}

impl SviExperiment {
    /// Build the model named by `config.scm` and its driver.
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        let model = build_scm(&config.scm)?;
        Self::with_model(config, model)
    }

    /// Driver around an already constructed model.
    pub fn with_model(config: ExperimentConfig, model: Box<dyn StructuralCausalModel>) -> Result<Self> {
        let svi = Svi::new(model, &config)?;
        let rng = StdRng::seed_from_u64(config.seed);
        log::info!("experiment: {} scm, seed {}", svi.model().kind(), config.seed);
        Ok(Self { config, svi, rng, current_epoch: 0 })
    }

    /// Configuration of the run.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// SVI driver.
    pub fn svi(&self) -> &Svi {
        &self.svi
    }

    /// The model being trained.
    pub fn model(&self) -> &dyn StructuralCausalModel {
        self.svi.model()
    }

    /// Scale intensities to `[0, 255]`, add uniform dequantisation noise and
    /// turn the covariates into columns.
    pub fn prep_batch(&mut self, batch: &RawBatch) -> Result<Observation> {
        let rng = &mut self.rng;
        let x = batch.image.map(|p| p * PIXEL_SCALE + rng.random::<f64>());
        Observation::new(
            x,
            column(&batch.sex),
            column(&batch.age),
            column(&batch.ventricle_volume),
            column(&batch.brain_volume),
        )
    }

    /// Trace the posterior guide and the model replayed on it, and log every site.
    pub fn print_trace_updates(&mut self, obs: &Observation) -> Result<()> {
        let scm = self.svi.model();
        let model = SviModel { scm, obs };
        let guide = SviGuide { scm, obs, kind: GuideKind::Posterior };
        let (model_trace, guide_trace) = TraceGraphElbo::default().traces(&model, &guide, scm.params(), &mut self.rng)?;
        log::info!("Traces:");
        log_trace_updates(&model_trace, &guide_trace)
    }

    /// Metrics from the traces retained by the last loss evaluation.
    pub fn get_trace_metrics(&self) -> Result<Metrics> {
        let (model, guide) = self
            .svi
            .loss()
            .traces()
            .ok_or_else(|| Error::Validation("no traces retained yet".to_string()))?;
        trace_metrics(model, guide)
    }

    /// One optimization step. A NaN loss is fatal.
    pub fn training_step(&mut self, batch: &RawBatch, batch_idx: usize) -> Result<StepOutput> {
        let obs = self.prep_batch(batch)?;
        if self.config.validate {
            log::info!("Validation:");
            self.print_trace_updates(&obs)?;
        }
        let loss = self.svi.step(&obs, &mut self.rng)?;
        let metrics = self.get_trace_metrics()?;
        if loss.is_nan() {
            log::error!("NaN loss at epoch {} batch {batch_idx}: {metrics}", self.current_epoch);
            return Err(Error::NanLoss { metrics: metrics.to_string() });
        }
        log::debug!("train batch {batch_idx}: loss {loss}");
        let mut logs = metrics.clone();
        logs.extend(metrics.with_prefix("train/"));
        logs.insert("train/loss", loss);
        Ok(StepOutput::new(loss, logs))
    }

    fn evaluation_step(&mut self, batch: &RawBatch, prefix: &str) -> Result<StepOutput> {
        let obs = self.prep_batch(batch)?;
        let loss = self.svi.evaluate_loss(&obs, &mut self.rng)?;
        let metrics = self.get_trace_metrics()?;
        let mut logs = metrics.clone();
        logs.extend(metrics.with_prefix(prefix));
        logs.insert(format!("{prefix}loss"), loss);
        Ok(StepOutput::new(loss, logs))
    }

    /// Loss and metrics on a held-out batch; parameters are not updated.
    pub fn validation_step(&mut self, batch: &RawBatch, _batch_idx: usize) -> Result<StepOutput> {
        self.evaluation_step(batch, "val/")
    }

    /// Loss and metrics on a test batch; parameters are not updated.
    pub fn test_step(&mut self, batch: &RawBatch, _batch_idx: usize) -> Result<StepOutput> {
        self.evaluation_step(batch, "test/")
    }

    /// Mean reconstruction of a batch over `num_sample_particles` posterior draws.
    pub fn reconstruct_batch(&mut self, batch: &RawBatch) -> Result<DMatrix<f64>> {
        let obs = self.prep_batch(batch)?;
        self.svi.model().reconstruct(&obs, self.config.num_sample_particles, &mut self.rng)
    }

    /// Counterfactual of a batch under `condition`, averaged over
    /// `num_sample_particles`.
    pub fn counterfactual_batch(&mut self, batch: &RawBatch, condition: &Values) -> Result<ScmSample> {
        let obs = self.prep_batch(batch)?.to_values();
        self.svi.model().counterfactual(&obs, condition, self.config.num_sample_particles, &mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScmConfig;
    use crate::exec::Overrides;
    use approx::assert_relative_eq;

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            scm: ScmConfig {
                latent_dim: 2,
                enc_filters: "4".to_string(),
                dec_filters: "4".to_string(),
                num_convolutions: 1,
                image_height: 2,
                image_width: 2,
                flow_hidden: vec![3],
                logstd_init: 0.0,
                ..ScmConfig::default()
            },
            num_svi_particles: 1,
            num_sample_particles: 2,
            seed: 42,
            ..ExperimentConfig::default()
        }
    }

    fn raw_batch(exp: &SviExperiment, n: usize) -> RawBatch {
        let mut rng = StdRng::seed_from_u64(7);
        let s = exp.model().sample(n, &Overrides::new(), &mut rng).unwrap();
        RawBatch {
            image: s.x.map(|p| (p / PIXEL_SCALE).clamp(0.0, 1.0)),
            age: s.age.column(0).into_owned(),
            sex: s.sex.column(0).into_owned(),
            ventricle_volume: s.ventricle_volume.column(0).into_owned(),
            brain_volume: s.brain_volume.column(0).into_owned(),
        }
    }

    #[test]
    fn test_prep_batch_dequantises() {
        let mut exp = SviExperiment::new(config()).unwrap();
        let batch = raw_batch(&exp, 3);
        let obs = exp.prep_batch(&batch).unwrap();
        assert_eq!(obs.age.shape(), (3, 1));
        assert_relative_eq!(obs.age[(2, 0)], batch.age[2]);
        for (x, p) in obs.x.iter().zip(batch.image.iter()) {
            let d = x - p * PIXEL_SCALE;
            assert!((0.0..1.0).contains(&d), "{d}");
        }
    }

    #[test]
    fn test_training_step_outputs_prefixed_metrics() {
        let mut cfg = config();
        cfg.validate = true;
        let mut exp = SviExperiment::new(cfg).unwrap();
        let batch = raw_batch(&exp, 4);
        let out = exp.training_step(&batch, 0).unwrap();
        assert!(out.loss.is_finite());
        assert_relative_eq!(out.metrics.get("train/loss").unwrap(), out.loss);
        assert_eq!(out.metrics.get("log p(x)"), out.metrics.get("train/log p(x)"));
        assert!(out.metrics.get("train/q(z)").is_some());
    }

    #[test]
    fn test_evaluation_steps() {
        let mut exp = SviExperiment::new(config()).unwrap();
        let batch = raw_batch(&exp, 2);
        let before: Vec<_> = exp.model().params().iter().map(|(_, p)| p.value.clone()).collect();
        let val = exp.validation_step(&batch, 0).unwrap();
        let test = exp.test_step(&batch, 0).unwrap();
        assert_relative_eq!(val.metrics.get("val/loss").unwrap(), val.loss);
        assert_relative_eq!(test.metrics.get("test/loss").unwrap(), test.loss);
        let after: Vec<_> = exp.model().params().iter().map(|(_, p)| p.value.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_metrics_before_any_step() {
        let exp = SviExperiment::new(config()).unwrap();
        assert!(matches!(exp.get_trace_metrics(), Err(Error::Validation(_))));
    }
}
