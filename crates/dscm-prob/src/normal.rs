//! Normal distribution utilities.

use dscm_ad::tape::{Tape, Var};
use dscm_core::{Error, Result};

/// Natural log of `sqrt(2π)`.
///
/// `ln(sqrt(2π)) = 0.5*ln(2π)` (precomputed to keep this crate const-friendly).
pub const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Log-PDF of a Normal distribution `N(mu, sigma)` at `x`.
///
/// `log p(x) = -0.5 * ((x-mu)/sigma)^2 - ln(sigma) - ln(sqrt(2π))`
pub fn logpdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    let z = (x - mu) / sigma;
    Ok(-0.5 * z * z - sigma.ln() - LN_SQRT_2PI)
}

/// Negative log-likelihood for a Normal distribution `N(mu, sigma)` at `x`.
pub fn nll(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    Ok(-logpdf(x, mu, sigma)?)
}

/// Elementwise [`logpdf`] recorded on a tape; `mu` and `sigma` broadcast onto `x`.
///
/// No validation: a non-positive `sigma` yields NaN, which callers detect on the loss.
pub fn logpdf_var(tape: &mut Tape, x: Var, mu: Var, sigma: Var) -> Result<Var> {
    let diff = tape.sub(x, mu)?;
    let z = tape.div(diff, sigma)?;
    let z2 = tape.powi(z, 2);
    let quad = tape.mul_f64(z2, -0.5);
    let ln_sigma = tape.ln(sigma);
    let lp = tape.sub(quad, ln_sigma)?;
    Ok(tape.add_f64(lp, -LN_SQRT_2PI))
}
