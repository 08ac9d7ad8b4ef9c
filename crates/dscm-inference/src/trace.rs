//! Execution traces.
//!
//! A [`Trace`] is the immutable record of one execution of the model or the
//! guide: every named site in execution order with its value, the distribution
//! it was drawn from, and its per-row log-probability. Traces are plain `f64`
//! snapshots, detached from the tape that produced them, and serialise to JSON.

use dscm_core::{Error, Result};
use dscm_prob::DistDescriptor;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::values::Variable;

/// How a site obtained its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    /// Drawn from (or scored under) its distribution.
    Sample,
    /// Computed from other sites; carries no density of its own.
    Deterministic,
    /// Fixed by an intervention; its mechanism was not evaluated.
    Intervened,
}

/// One named site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Site name.
    pub name: String,
    /// How the value was obtained.
    pub kind: SiteKind,
    /// Value, `n × d`.
    pub value: DMatrix<f64>,
    /// Distribution parameters at execution time.
    pub distribution: DistDescriptor,
    /// Log-probability of each batch row, summed over the event dimension.
    pub log_prob: DVector<f64>,
    /// Sum of `log_prob`.
    pub log_prob_sum: f64,
    /// Whether the value was supplied by conditioning on data.
    pub is_observed: bool,
    /// Base value of a transformed distribution (the exogenous noise).
    pub base_value: Option<DMatrix<f64>>,
}

impl Site {
    /// Whether the site contributes to the joint log-density.
    pub fn is_scored(&self) -> bool {
        self.kind == SiteKind::Sample
    }

    /// Whether the site is an unobserved random draw.
    pub fn is_latent(&self) -> bool {
        self.kind == SiteKind::Sample && !self.is_observed
    }

    /// Whether the log-probability contains a NaN.
    pub fn has_nan(&self) -> bool {
        self.log_prob_sum.is_nan() || self.log_prob.iter().any(|v| v.is_nan())
    }
}

/// Ordered record of one program execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    sites: Vec<Site>,
}

impl Trace {
    /// Empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a site; names are unique within a trace.
    pub fn push(&mut self, site: Site) -> Result<()> {
        if self.get(&site.name).is_some() {
            return Err(Error::Validation(format!("site '{}' already recorded", site.name)));
        }
        self.sites.push(site);
        Ok(())
    }

    /// Site by name.
    pub fn get(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.name == name)
    }

    /// Site by name, as an error when absent.
    pub fn site(&self, name: &str) -> Result<&Site> {
        self.get(name).ok_or_else(|| Error::Validation(format!("trace has no site '{name}'")))
    }

    /// Site of a graph variable.
    pub fn variable(&self, v: Variable) -> Result<&Site> {
        self.site(v.name())
    }

    /// Image site.
    pub fn x(&self) -> Result<&Site> {
        self.variable(Variable::X)
    }

    /// Latent code site.
    pub fn z(&self) -> Result<&Site> {
        self.variable(Variable::Z)
    }

    /// Sex site.
    pub fn sex(&self) -> Result<&Site> {
        self.variable(Variable::Sex)
    }

    /// Age site.
    pub fn age(&self) -> Result<&Site> {
        self.variable(Variable::Age)
    }

    /// Ventricle volume site.
    pub fn ventricle_volume(&self) -> Result<&Site> {
        self.variable(Variable::VentricleVolume)
    }

    /// Brain volume site.
    pub fn brain_volume(&self) -> Result<&Site> {
        self.variable(Variable::BrainVolume)
    }

    /// Sites in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &Site> {
        self.sites.iter()
    }

    /// Site names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.sites.iter().map(|s| s.name.as_str()).collect()
    }

    /// Number of sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether the trace is empty.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Sum of the log-probabilities of all scored sites.
    pub fn log_prob_sum(&self) -> f64 {
        self.sites.iter().filter(|s| s.is_scored()).map(|s| s.log_prob_sum).sum()
    }

    /// Serialise to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a trace from JSON.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(name: &str, kind: SiteKind, lp: &[f64], observed: bool) -> Site {
        let log_prob = DVector::from_row_slice(lp);
        Site {
            name: name.to_string(),
            kind,
            value: DMatrix::zeros(lp.len(), 1),
            distribution: DistDescriptor::Delta,
            log_prob_sum: log_prob.sum(),
            log_prob,
            is_observed: observed,
            base_value: None,
        }
    }

    #[test]
    fn test_lookup_and_order() {
        let mut t = Trace::new();
        t.push(site("sex", SiteKind::Sample, &[-0.7, -0.7], true)).unwrap();
        t.push(site("z", SiteKind::Sample, &[-1.0, -2.0], false)).unwrap();
        t.push(site("age", SiteKind::Intervened, &[0.0, 0.0], false)).unwrap();
        assert_eq!(t.names(), vec!["sex", "z", "age"]);
        assert!(t.z().unwrap().is_latent());
        assert!(!t.sex().unwrap().is_latent());
        assert!(t.x().is_err());
        assert!((t.log_prob_sum() - (-4.4)).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_site_rejected() {
        let mut t = Trace::new();
        t.push(site("z", SiteKind::Sample, &[0.0], false)).unwrap();
        assert!(t.push(site("z", SiteKind::Sample, &[0.0], false)).is_err());
    }

    #[test]
    fn test_nan_detection() {
        assert!(site("x", SiteKind::Sample, &[f64::NAN], true).has_nan());
        assert!(!site("x", SiteKind::Sample, &[-3.0], true).has_nan());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut t = Trace::new();
        t.push(site("brain_volume", SiteKind::Deterministic, &[0.0], false)).unwrap();
        let json = t.to_json().unwrap();
        assert!(json.contains("\"kind\": \"deterministic\""));
        assert_eq!(Trace::from_json(&json).unwrap(), t);
    }
}
