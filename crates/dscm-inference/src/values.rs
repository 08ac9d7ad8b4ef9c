//! Variables, observations and named value mappings.
//!
//! Covariates are `n × 1` columns and images are `n × (height · width)` rows of
//! pixel intensities. String-keyed [`Values`] are the currency of conditioning
//! and intervention; [`Observation`] and [`ScmSample`] are their typed views.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use dscm_ad::matrix::VarMatrix;
use dscm_ad::tape::Tape;
use dscm_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// A named variable of the causal graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    /// Image.
    X,
    /// Latent code.
    Z,
    /// Binary sex indicator.
    Sex,
    /// Age in years.
    Age,
    /// Ventricle volume.
    VentricleVolume,
    /// Brain volume.
    BrainVolume,
}

impl Variable {
    /// Order in which sampled and counterfactual values are reported.
    pub const CANONICAL: [Variable; 6] = [
        Variable::X,
        Variable::Z,
        Variable::Sex,
        Variable::Age,
        Variable::VentricleVolume,
        Variable::BrainVolume,
    ];

    /// The exact key set of an observation.
    pub const OBSERVED: [Variable; 5] = [
        Variable::X,
        Variable::Sex,
        Variable::Age,
        Variable::VentricleVolume,
        Variable::BrainVolume,
    ];

    /// Site name.
    pub fn name(self) -> &'static str {
        match self {
            Variable::X => "x",
            Variable::Z => "z",
            Variable::Sex => "sex",
            Variable::Age => "age",
            Variable::VentricleVolume => "ventricle_volume",
            Variable::BrainVolume => "brain_volume",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Variable::CANONICAL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| Error::Validation(format!("unknown variable '{s}'")))
    }
}

/// Ordered mapping from site name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(BTreeMap<String, DMatrix<f64>>);

impl Values {
    /// Empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: DMatrix<f64>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or overwrite a value.
    pub fn insert(&mut self, name: impl Into<String>, value: DMatrix<f64>) {
        self.0.insert(name.into(), value);
    }

    /// Value by name.
    pub fn get(&self, name: &str) -> Option<&DMatrix<f64>> {
        self.0.get(name)
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Remove and return a value.
    pub fn remove(&mut self, name: &str) -> Option<DMatrix<f64>> {
        self.0.remove(name)
    }

    /// Names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DMatrix<f64>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Add all entries of `other`, overwriting on collisions.
    pub fn extend(&mut self, other: Values) {
        self.0.extend(other.0);
    }
}

fn check_column(name: &str, m: &DMatrix<f64>, n: usize) -> Result<()> {
    if m.shape() != (n, 1) {
        return Err(Error::Validation(format!(
            "'{name}' must be a {n}x1 column, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    Ok(())
}

/// A batch of fully observed instances: the five observed variables, no latent code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Images, `n × pixels`.
    pub x: DMatrix<f64>,
    /// Sex, `n × 1` in `{0, 1}`.
    pub sex: DMatrix<f64>,
    /// Age, `n × 1`.
    pub age: DMatrix<f64>,
    /// Ventricle volume, `n × 1`.
    pub ventricle_volume: DMatrix<f64>,
    /// Brain volume, `n × 1`.
    pub brain_volume: DMatrix<f64>,
}

impl Observation {
    /// Build an observation, checking that all parts share the batch size.
    pub fn new(
        x: DMatrix<f64>,
        sex: DMatrix<f64>,
        age: DMatrix<f64>,
        ventricle_volume: DMatrix<f64>,
        brain_volume: DMatrix<f64>,
    ) -> Result<Self> {
        let n = x.nrows();
        if n == 0 {
            return Err(Error::Validation("observation batch is empty".to_string()));
        }
        check_column("sex", &sex, n)?;
        if let Some(bad) = sex.iter().find(|&&s| s != 0.0 && s != 1.0) {
            return Err(Error::Validation(format!("sex must be 0 or 1, got {bad}")));
        }
        check_column("age", &age, n)?;
        check_column("ventricle_volume", &ventricle_volume, n)?;
        check_column("brain_volume", &brain_volume, n)?;
        Ok(Self { x, sex, age, ventricle_volume, brain_volume })
    }

    /// Number of instances.
    pub fn batch_size(&self) -> usize {
        self.x.nrows()
    }

    /// Value of an observed variable; `None` for `z`.
    pub fn get(&self, v: Variable) -> Option<&DMatrix<f64>> {
        match v {
            Variable::X => Some(&self.x),
            Variable::Sex => Some(&self.sex),
            Variable::Age => Some(&self.age),
            Variable::VentricleVolume => Some(&self.ventricle_volume),
            Variable::BrainVolume => Some(&self.brain_volume),
            Variable::Z => None,
        }
    }

    /// Observed variables without the image, for conditioning the covariate sites.
    pub fn covariates(&self) -> Values {
        Values::new()
            .with("sex", self.sex.clone())
            .with("age", self.age.clone())
            .with("ventricle_volume", self.ventricle_volume.clone())
            .with("brain_volume", self.brain_volume.clone())
    }

    /// All five observed variables as named values.
    pub fn to_values(&self) -> Values {
        self.covariates().with("x", self.x.clone())
    }
}

impl TryFrom<&Values> for Observation {
    type Error = Error;

    /// Requires exactly the keys `x, sex, age, ventricle_volume, brain_volume`.
    fn try_from(values: &Values) -> Result<Self> {
        let expected: Vec<&str> = Variable::OBSERVED.iter().map(|v| v.name()).collect();
        let exact = values.len() == expected.len() && expected.iter().all(|k| values.contains(k));
        if !exact {
            return Err(Error::ObservationMismatch { got: values.keys() });
        }
        let take = |k: &str| values.get(k).cloned().ok_or(Error::ObservationMismatch { got: values.keys() });
        Observation::new(
            take("x")?,
            take("sex")?,
            take("age")?,
            take("ventricle_volume")?,
            take("brain_volume")?,
        )
    }
}

/// An unprocessed batch as produced by a data loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    /// Images with intensities in `[0, 1]`, `n × pixels`.
    pub image: DMatrix<f64>,
    /// Age per instance.
    pub age: DVector<f64>,
    /// Sex per instance.
    pub sex: DVector<f64>,
    /// Ventricle volume per instance.
    pub ventricle_volume: DVector<f64>,
    /// Brain volume per instance.
    pub brain_volume: DVector<f64>,
}

impl RawBatch {
    /// Number of instances.
    pub fn batch_size(&self) -> usize {
        self.image.nrows()
    }
}

/// One value per variable of the graph, in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScmSample {
    /// Images.
    pub x: DMatrix<f64>,
    /// Latent codes.
    pub z: DMatrix<f64>,
    /// Sex.
    pub sex: DMatrix<f64>,
    /// Age.
    pub age: DMatrix<f64>,
    /// Ventricle volume.
    pub ventricle_volume: DMatrix<f64>,
    /// Brain volume.
    pub brain_volume: DMatrix<f64>,
}

impl ScmSample {
    /// Value of `v`.
    pub fn get(&self, v: Variable) -> &DMatrix<f64> {
        match v {
            Variable::X => &self.x,
            Variable::Z => &self.z,
            Variable::Sex => &self.sex,
            Variable::Age => &self.age,
            Variable::VentricleVolume => &self.ventricle_volume,
            Variable::BrainVolume => &self.brain_volume,
        }
    }

    /// `(variable, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Variable, &DMatrix<f64>)> {
        Variable::CANONICAL.into_iter().map(move |v| (v, self.get(v)))
    }

    /// The observed part.
    pub fn observation(&self) -> Result<Observation> {
        Observation::new(
            self.x.clone(),
            self.sex.clone(),
            self.age.clone(),
            self.ventricle_volume.clone(),
            self.brain_volume.clone(),
        )
    }

    /// Elementwise mean of equally shaped samples.
    pub fn mean(samples: &[ScmSample]) -> Result<ScmSample> {
        let Some(first) = samples.first() else {
            return Err(Error::Validation("cannot average zero samples".to_string()));
        };
        let avg = |v: Variable| -> Result<DMatrix<f64>> {
            let mut acc = DMatrix::zeros(first.get(v).nrows(), first.get(v).ncols());
            for s in samples {
                let m = s.get(v);
                if m.shape() != acc.shape() {
                    return Err(Error::Validation(format!("sample shapes differ for '{v}'")));
                }
                acc += m;
            }
            Ok(acc / samples.len() as f64)
        };
        Ok(ScmSample {
            x: avg(Variable::X)?,
            z: avg(Variable::Z)?,
            sex: avg(Variable::Sex)?,
            age: avg(Variable::Age)?,
            ventricle_volume: avg(Variable::VentricleVolume)?,
            brain_volume: avg(Variable::BrainVolume)?,
        })
    }
}

/// Observed variables recorded on a tape, as seen by the guide.
///
/// Values may be constants or results of earlier tape computations (for
/// example a counterfactual image).
#[derive(Debug, Clone)]
pub struct ObservedVars {
    /// Images.
    pub x: VarMatrix,
    /// Sex.
    pub sex: VarMatrix,
    /// Age.
    pub age: VarMatrix,
    /// Ventricle volume.
    pub ventricle_volume: VarMatrix,
    /// Brain volume.
    pub brain_volume: VarMatrix,
}

impl ObservedVars {
    /// Record an observation as constants.
    pub fn constant(tape: &mut Tape, obs: &Observation) -> Self {
        Self {
            x: VarMatrix::constant(tape, &obs.x),
            sex: VarMatrix::constant(tape, &obs.sex),
            age: VarMatrix::constant(tape, &obs.age),
            ventricle_volume: VarMatrix::constant(tape, &obs.ventricle_volume),
            brain_volume: VarMatrix::constant(tape, &obs.brain_volume),
        }
    }
}

/// Every variable of one execution of the generative process, on the tape.
#[derive(Debug, Clone)]
pub struct ScmVars {
    /// Images.
    pub x: VarMatrix,
    /// Latent codes.
    pub z: VarMatrix,
    /// Sex.
    pub sex: VarMatrix,
    /// Age.
    pub age: VarMatrix,
    /// Ventricle volume.
    pub ventricle_volume: VarMatrix,
    /// Brain volume.
    pub brain_volume: VarMatrix,
}

impl ScmVars {
    /// Read the values off the tape.
    pub fn value(&self, tape: &Tape) -> ScmSample {
        ScmSample {
            x: self.x.value(tape),
            z: self.z.value(tape),
            sex: self.sex.value(tape),
            age: self.age.value(tape),
            ventricle_volume: self.ventricle_volume.value(tape),
            brain_volume: self.brain_volume.value(tape),
        }
    }
}
