//! Model and experiment configuration.

use std::fmt;

use dscm_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::flows::LogNormalization;

/// Which causal graph to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmKind {
    /// All covariates drawn independently.
    Independent,
    /// `brain_volume` depends on `(sex, age)`, `ventricle_volume` on `(age, brain_volume)`.
    #[default]
    Conditional,
}

impl fmt::Display for ScmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScmKind::Independent => write!(f, "independent"),
            ScmKind::Conditional => write!(f, "conditional"),
        }
    }
}

/// Log-space normalisation constants of the positive covariates.
///
/// These are fixed buffers, never trained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovariateNormalization {
    /// Age.
    pub age: LogNormalization,
    /// Ventricle volume.
    pub ventricle_volume: LogNormalization,
    /// Brain volume.
    pub brain_volume: LogNormalization,
}

impl Default for CovariateNormalization {
    fn default() -> Self {
        Self {
            age: LogNormalization { loc: 4.1, scale: 0.12 },
            ventricle_volume: LogNormalization { loc: 10.3, scale: 0.45 },
            brain_volume: LogNormalization { loc: 13.9, scale: 0.08 },
        }
    }
}

/// Parse a comma-separated width list such as `"16,24,32"`.
pub fn parse_filters(s: &str) -> Result<Vec<usize>> {
    let widths = s
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<usize>()
                .ok()
                .filter(|&w| w > 0)
                .ok_or_else(|| Error::Validation(format!("invalid filter width '{p}' in '{s}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    if widths.is_empty() {
        return Err(Error::Validation(format!("empty filter list '{s}'")));
    }
    Ok(widths)
}

/// Architecture of the structural causal model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScmConfig {
    /// Variant selected from the construction table.
    pub kind: ScmKind,
    /// Dimension of the latent code `z`.
    pub latent_dim: usize,
    /// Initial value of the per-pixel image log-scale.
    pub logstd_init: f64,
    /// Encoder stage widths, comma-separated.
    pub enc_filters: String,
    /// Decoder stage widths, comma-separated.
    pub dec_filters: String,
    /// Layers per stage.
    pub num_convolutions: usize,
    /// Finish the decoder with a learned 2×2 upsampling.
    pub use_upconv: bool,
    /// Image rows.
    pub image_height: usize,
    /// Image columns.
    pub image_width: usize,
    /// Hidden widths of the conditional covariate flows.
    pub flow_hidden: Vec<usize>,
    /// Seed of the parameter initialisation.
    pub init_seed: u64,
    /// Covariate normalisation buffers.
    pub normalization: CovariateNormalization,
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            kind: ScmKind::Conditional,
            latent_dim: 100,
            logstd_init: -5.0,
            enc_filters: "16,24,32,64,128".to_string(),
            dec_filters: "128,64,32,24,16".to_string(),
            num_convolutions: 3,
            use_upconv: false,
            image_height: 192,
            image_width: 192,
            flow_hidden: vec![8, 16],
            init_seed: 0,
            normalization: CovariateNormalization::default(),
        }
    }
}

impl ScmConfig {
    /// Parsed encoder widths.
    pub fn enc_widths(&self) -> Result<Vec<usize>> {
        parse_filters(&self.enc_filters)
    }

    /// Parsed decoder widths.
    pub fn dec_widths(&self) -> Result<Vec<usize>> {
        parse_filters(&self.dec_filters)
    }

    /// Pixels per image.
    pub fn num_pixels(&self) -> usize {
        self.image_height * self.image_width
    }

    /// Check ranges and parse the filter lists.
    pub fn validate(&self) -> Result<()> {
        if self.latent_dim == 0 {
            return Err(Error::Validation("latent_dim must be positive".to_string()));
        }
        if self.num_pixels() == 0 {
            return Err(Error::Validation("image size must be positive".to_string()));
        }
        if self.use_upconv && (self.image_height % 2 != 0 || self.image_width % 2 != 0) {
            return Err(Error::Validation(format!(
                "use_upconv needs even image sides, got {}x{}",
                self.image_height, self.image_width
            )));
        }
        if !self.logstd_init.is_finite() {
            return Err(Error::Validation("logstd_init must be finite".to_string()));
        }
        if self.num_convolutions == 0 {
            return Err(Error::Validation("num_convolutions must be at least 1".to_string()));
        }
        if self.flow_hidden.contains(&0) {
            return Err(Error::Validation("flow hidden widths must be positive".to_string()));
        }
        self.enc_widths()?;
        self.dec_widths()?;
        self.normalization.age.validate()?;
        self.normalization.ventricle_volume.validate()?;
        self.normalization.brain_volume.validate()
    }
}

/// Which volume the counterfactual guide perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum CounterfactualType {
    /// One of the fixed types chosen uniformly per batch.
    #[default]
    Random,
    /// Ventricle volume only.
    VentricleVolume,
    /// Brain volume only.
    BrainVolume,
    /// Both volumes.
    Both,
}

impl CounterfactualType {
    /// The fixed (non-random) types.
    pub const FIXED: [CounterfactualType; 3] =
        [CounterfactualType::VentricleVolume, CounterfactualType::BrainVolume, CounterfactualType::Both];

    /// Whether ventricle volume is perturbed.
    pub fn perturbs_ventricle_volume(self) -> bool {
        matches!(self, CounterfactualType::VentricleVolume | CounterfactualType::Both)
    }

    /// Whether brain volume is perturbed.
    pub fn perturbs_brain_volume(self) -> bool {
        matches!(self, CounterfactualType::BrainVolume | CounterfactualType::Both)
    }

    /// The type used for one batch: `Random` draws one of [`FIXED`](Self::FIXED),
    /// the others are returned as is.
    pub fn resolve<R: Rng + ?Sized>(self, rng: &mut R) -> CounterfactualType {
        match self {
            CounterfactualType::Random => Self::FIXED[rng.random_range(0..Self::FIXED.len())],
            fixed => fixed,
        }
    }
}

impl TryFrom<i8> for CounterfactualType {
    type Error = Error;

    fn try_from(v: i8) -> Result<Self> {
        match v {
            -1 => Ok(CounterfactualType::Random),
            0 => Ok(CounterfactualType::VentricleVolume),
            1 => Ok(CounterfactualType::BrainVolume),
            2 => Ok(CounterfactualType::Both),
            other => Err(Error::Validation(format!("cf_elbo_type must be one of -1, 0, 1, 2, got {other}"))),
        }
    }
}

impl From<CounterfactualType> for i8 {
    fn from(t: CounterfactualType) -> i8 {
        match t {
            CounterfactualType::Random => -1,
            CounterfactualType::VentricleVolume => 0,
            CounterfactualType::BrainVolume => 1,
            CounterfactualType::Both => 2,
        }
    }
}

/// Training and inference settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Model architecture.
    pub scm: ScmConfig,
    /// ELBO particles per step.
    pub num_svi_particles: usize,
    /// Particles of reconstruction and counterfactual estimates.
    pub num_sample_particles: usize,
    /// Train against the counterfactual guide instead of the posterior guide.
    pub use_cf_guide: bool,
    /// Counterfactual type of the counterfactual guide.
    pub cf_elbo_type: CounterfactualType,
    /// Learning rate of the encoder, decoder and guide.
    pub lr: f64,
    /// Learning rate of the causal-mechanism flows.
    pub pgm_lr: f64,
    /// Weight decay.
    pub l2: f64,
    /// AMSGrad variant of Adam.
    pub use_amsgrad: bool,
    /// Log per-site trace diagnostics each training step.
    pub validate: bool,
    /// Seed of the experiment's random stream.
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            scm: ScmConfig::default(),
            num_svi_particles: 4,
            num_sample_particles: 32,
            use_cf_guide: false,
            cf_elbo_type: CounterfactualType::Random,
            lr: 1e-4,
            pgm_lr: 5e-3,
            l2: 0.0,
            use_amsgrad: false,
            validate: false,
            seed: 0,
        }
    }
}

impl ExperimentConfig {
    /// Parse and validate a JSON document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        self.scm.validate()?;
        if self.num_svi_particles == 0 || self.num_sample_particles == 0 {
            return Err(Error::Validation("particle counts must be positive".to_string()));
        }
        for (name, lr) in [("lr", self.lr), ("pgm_lr", self.pgm_lr)] {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(Error::Validation(format!("{name} must be positive, got {lr}")));
            }
        }
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return Err(Error::Validation(format!("l2 must be non-negative, got {}", self.l2)));
        }
        Ok(())
    }
}
