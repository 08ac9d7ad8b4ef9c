//! Numerically stable scalar kernels shared by the tape and the distributions.

/// Stable `log(1 + exp(x))`.
///
/// Branchless: `log(1+exp(x)) = max(x,0) + log(1+exp(-|x|))`.
#[inline]
pub fn log1pexp(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    x.max(0.0) + e.ln_1p()
}

/// Stable softplus: `log(1 + exp(x))`.
#[inline]
pub fn softplus(x: f64) -> f64 {
    log1pexp(x)
}

/// Stable sigmoid: `1 / (1 + exp(-x))`.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    let recip = 1.0 / (1.0 + e);
    if x >= 0.0 { recip } else { e * recip }
}

/// Stable `log(sigmoid(x))`.
#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 { -(-x).exp().ln_1p() } else { x - x.exp().ln_1p() }
}

/// Inverse of [`sigmoid`]: `ln(p) - ln(1 - p)`.
#[inline]
pub fn logit(p: f64) -> f64 {
    p.ln() - (-p).ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log1pexp_extremes() {
        assert_relative_eq!(log1pexp(0.0), 2.0_f64.ln(), epsilon = 1e-15);
        assert_relative_eq!(log1pexp(800.0), 800.0, epsilon = 1e-12);
        assert!(log1pexp(-800.0) >= 0.0);
        assert!(log1pexp(-800.0) < 1e-300);
    }

    #[test]
    fn test_sigmoid_symmetry() {
        for &x in &[-30.0, -2.5, 0.0, 0.7, 40.0] {
            assert_relative_eq!(sigmoid(x) + sigmoid(-x), 1.0, epsilon = 1e-15);
            assert_relative_eq!(log_sigmoid(x), sigmoid(x).ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_logit_inverts_sigmoid() {
        for &x in &[-8.0, -0.3, 0.0, 2.0, 9.5] {
            assert_relative_eq!(logit(sigmoid(x)), x, epsilon = 1e-9);
        }
    }
}
