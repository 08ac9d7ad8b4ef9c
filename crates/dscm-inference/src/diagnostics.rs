//! Per-site diagnostics from a `(model, guide)` trace pair.
//!
//! Metrics are read from the summed log-probabilities of the named sites:
//! - `log p(v)` for each observed variable `v`, from the model trace
//! - `p(z)` and `q(z)`, the latent code under the prior and under the guide
//! - `log p(z) - log q(z)`

use dscm_core::{Error, Metrics, Result};

use crate::trace::{Site, Trace};
use crate::values::Variable;

/// Metric names in the order they are reported.
pub const METRIC_NAMES: [&str; 8] = [
    "log p(x)",
    "log p(age)",
    "log p(sex)",
    "log p(ventricle_volume)",
    "log p(brain_volume)",
    "log p(z) - log q(z)",
    "p(z)",
    "q(z)",
];

/// Build the metrics of one step. Each `log p(v)` comes from the site `v` itself.
pub fn trace_metrics(model: &Trace, guide: &Trace) -> Result<Metrics> {
    let mut metrics = Metrics::new();
    for v in [Variable::X, Variable::Age, Variable::Sex, Variable::VentricleVolume, Variable::BrainVolume] {
        metrics.insert(format!("log p({v})"), model.variable(v)?.log_prob_sum);
    }
    let p_z = model.z()?.log_prob_sum;
    let q_z = guide.z()?.log_prob_sum;
    metrics.insert("log p(z) - log q(z)", p_z - q_z);
    metrics.insert("p(z)", p_z);
    metrics.insert("q(z)", q_z);
    Ok(metrics)
}

fn log_site(role: &str, symbol: &str, site: &Site) -> Result<()> {
    log::info!("{}: {} - {}", site.name, site.distribution, site.distribution.support());
    log::info!("{role} - {symbol}({}) = {} | obs={}", site.name, site.log_prob_sum, site.is_observed);
    if site.has_nan() {
        let first = site.value.row(0).iter().map(|v| format!("{v:.6}")).collect::<Vec<_>>().join(", ");
        log::error!(
            "NaN log-probability at {role} site '{}': value[0] = [{first}], distribution = {}",
            site.name,
            site.distribution
        );
        return Err(Error::NanLogProb { site: site.name.clone(), distribution: site.distribution.to_string() });
    }
    Ok(())
}

/// Log every scored site of both traces, failing on the first NaN log-probability.
pub fn log_trace_updates(model: &Trace, guide: &Trace) -> Result<()> {
    log::info!("model: {:?}", model.names());
    for site in model.iter().filter(|s| s.is_scored()) {
        log_site("model", "log p", site)?;
    }
    log::info!("guide: {:?}", guide.names());
    for site in guide.iter().filter(|s| s.is_scored()) {
        log_site("guide", "log q", site)?;
    }
    Ok(())
}
