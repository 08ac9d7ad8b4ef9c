//! Error types for deep structural causal models

use thiserror::Error;

/// Workspace error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// The observation key set is not exactly {x, sex, age, ventricle_volume, brain_volume}.
    #[error("Observation mismatch: expected x, sex, age, ventricle_volume, brain_volume but got: {}", .got.join(", "))]
    ObservationMismatch {
        /// Keys that were supplied.
        got: Vec<String>,
    },

    /// A trace site evaluated to a NaN log-probability.
    #[error("NaN log-probability at site '{site}': {distribution}")]
    NanLogProb {
        /// Site name.
        site: String,
        /// Rendered distribution parameters.
        distribution: String,
    },

    /// The training loss became NaN.
    #[error("NaN loss during training: {metrics}")]
    NanLoss {
        /// Rendered metrics of the failing step.
        metrics: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_mismatch_names_keys() {
        let err = Error::ObservationMismatch { got: vec!["age".to_string(), "x".to_string()] };
        let msg = err.to_string();
        assert!(msg.contains("got: age, x"), "{msg}");
    }

    #[test]
    fn test_json_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
