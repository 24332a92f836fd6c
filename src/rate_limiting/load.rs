use serde::Deserialize;

/// The CPU reading substituted for a deadline-exceeded failure. Missed deadlines are
/// read as a backend that is all but saturated.
pub const DEADLINE_OVERLOAD_CPU: f64 = 99.9;

/// Per-location CPU utilisation, in percent, as observed in one response.
pub type LoadSample = Vec<f64>;

/// Server-side load statistics attached to a response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServerStats {
    #[serde(default)]
    pub cpu_stats: Vec<CpuStats>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CpuStats {
    /// The backend location (zone, cluster, node) that reported this reading.
    pub location: String,
    pub cpu_percent: f64,
}

/// Implemented by response types that may carry [`ServerStats`].
pub trait LoadReport {
    /// `None` when the server did not sample load for this response.
    fn server_stats(&self) -> Option<&ServerStats>;
}

impl<T: LoadReport> LoadReport for &T {
    fn server_stats(&self) -> Option<&ServerStats> {
        (**self).server_stats()
    }
}

/// Pulls the CPU readings out of a response.
///
/// Readings that are not a finite, positive percentage are dropped and readings
/// above 100 are capped, so the result is safe to divide by. An empty sample is the
/// normal outcome for a response without stats.
pub fn extract_load<R: LoadReport + ?Sized>(response: &R) -> LoadSample {
    let Some(stats) = response.server_stats() else {
        return LoadSample::new();
    };

    stats
        .cpu_stats
        .iter()
        .filter_map(|stat| {
            if stat.cpu_percent.is_finite() && stat.cpu_percent > 0.0 {
                Some(stat.cpu_percent.min(100.0))
            } else {
                trace!(
                    target: "cpu_throttle::stats",
                    location = %stat.location,
                    cpu_percent = stat.cpu_percent,
                    "Dropping unusable CPU reading."
                );
                None
            }
        })
        .collect()
}

/// The proportional control law.
///
/// The busiest location drives the decision: `current_rate * target / max(samples)`.
/// An empty sample, or one without a usable reading, leaves the rate unchanged.
/// The result is not clamped; callers decide what to do with out-of-bounds
/// candidates.
pub fn compute_new_rate(samples: &[f64], target_cpu_percent: f64, current_rate: f64) -> f64 {
    let observed = samples
        .iter()
        .copied()
        .filter(|cpu| cpu.is_finite() && *cpu > 0.0)
        .fold(None, |max: Option<f64>, cpu| {
            Some(max.map_or(cpu, |m| m.max(cpu)))
        });

    match observed {
        Some(observed) => current_rate * (target_cpu_percent / observed),
        None => current_rate,
    }
}
