//! Bernoulli distribution utilities.

use dscm_ad::math::{log_sigmoid, softplus};
use dscm_ad::tape::{Tape, Var};
use dscm_core::{Error, Result};

/// Log-PMF of a Bernoulli distribution at `k ∈ {0, 1}` with success probability `p`.
pub fn logpmf(k: u8, p: f64) -> Result<f64> {
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(Error::Validation(format!("p must be finite and in [0,1], got {}", p)));
    }
    match k {
        0 => Ok((1.0 - p).ln()),
        1 => Ok(p.ln()),
        _ => Err(Error::Validation(format!("k must be 0 or 1, got {}", k))),
    }
}

/// Log-PMF of a Bernoulli distribution parameterised by the logit `eta = ln(p / (1 - p))`.
pub fn logpmf_logit(k: u8, eta: f64) -> Result<f64> {
    if eta.is_nan() {
        return Err(Error::Validation("logit must not be NaN".to_string()));
    }
    match k {
        0 => Ok(log_sigmoid(-eta)),
        1 => Ok(log_sigmoid(eta)),
        _ => Err(Error::Validation(format!("k must be 0 or 1, got {}", k))),
    }
}

/// Elementwise `k * eta - softplus(eta)` on a tape, the logit-form log-PMF for `k ∈ {0, 1}`.
///
/// `k` is a tape value so observed sex columns can be used directly.
pub fn logpmf_logit_var(tape: &mut Tape, k: Var, eta: Var) -> Result<Var> {
    let ke = tape.mul(k, eta)?;
    let sp = tape.softplus(eta);
    tape.sub(ke, sp)
}

/// Negative log-likelihood of a Bernoulli distribution at `k`.
pub fn nll(k: u8, p: f64) -> Result<f64> {
    Ok(-logpmf(k, p)?)
}

/// `softplus(eta) - k * eta`, the logit-form negative log-likelihood.
pub fn nll_logit(k: u8, eta: f64) -> Result<f64> {
    if k > 1 {
        return Err(Error::Validation(format!("k must be 0 or 1, got {}", k)));
    }
    Ok(softplus(eta) - f64::from(k) * eta)
}
