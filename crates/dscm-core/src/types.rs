//! Common data types shared by the training and evaluation drivers

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Named scalar diagnostics, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    /// Create an empty metrics mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a metric.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Look up a metric by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Number of metrics.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if no metric has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Copy of the mapping with every name prefixed by `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self(self.0.iter().map(|(k, v)| (format!("{prefix}{k}"), *v)).collect())
    }

    /// Add all entries of `other`, overwriting on name collisions.
    pub fn extend(&mut self, other: Metrics) {
        self.0.extend(other.0);
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Output of one training, validation or test step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    /// Scalar objective (negative ELBO).
    pub loss: f64,

    /// Diagnostics extracted from the retained traces.
    pub metrics: Metrics,
}

impl StepOutput {
    /// Create a new step output.
    pub fn new(loss: f64, metrics: Metrics) -> Self {
        Self { loss, metrics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_metrics_prefix_and_display() {
        let mut m = Metrics::new();
        m.insert("log p(x)", -1.5);
        m.insert("log p(age)", 0.25);
        let p = m.with_prefix("train/");
        assert_eq!(p.len(), 2);
        assert_relative_eq!(p.get("train/log p(x)").unwrap(), -1.5);
        assert_eq!(m.to_string(), "log p(age): 0.25, log p(x): -1.5");
    }

    #[test]
    fn test_step_output_serializes() {
        let mut m = Metrics::new();
        m.insert("q(z)", 3.0);
        let out = StepOutput::new(2.0, m);
        let json = serde_json::to_string(&out).unwrap();
        assert_eq!(json, r#"{"loss":2.0,"metrics":{"q(z)":3.0}}"#);
    }
}
