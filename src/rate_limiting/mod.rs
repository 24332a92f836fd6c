//! Throttle outgoing streaming calls according to the CPU load reported back by the server.

mod controller;
mod error;
pub mod internal_event;
mod layer;
mod limiter;
mod load;
mod service;
mod stats;
mod stream;

use std::time::Duration;

use bon::Builder;
use serde::Deserialize;

pub use controller::{Adjustment, Controller};
pub use error::{AcquireError, CallError, DeadlineExceeded, SettingsError};
pub use layer::RateLimitingLayer;
pub use limiter::RateLimiter;
pub use load::{
    CpuStats, DEADLINE_OVERLOAD_CPU, LoadReport, LoadSample, ServerStats, compute_new_rate,
    extract_load,
};
pub use service::RateLimitingService;
pub use stats::{RateLimitingStats, StatsSnapshot};
pub use stream::{CallState, FeedbackStream};

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the CPU feedback loop.
///
/// The defaults match a bulk-write client talking to a storage backend: start at
/// 10 000 requests per second, aim for 70% CPU on the busiest location, and change
/// the rate at most once per minute.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `initial_rate` | 10 000 | Permits per second before any feedback arrived |
/// | `target_cpu_percent` | 70 | Utilisation the control law steers towards |
/// | `cooldown` | 60 s | Minimum time between two committed adjustments |
/// | `lower_bound` | 10 | Candidates below this are not applied |
/// | `upper_bound` | 100 000 | Candidates above this are not applied |
/// | `max_burst_secs` | 1.0 | Seconds of unused permits an idle limiter may store |
/// | `acquire_timeout` | none | Upper bound on the wait at the call-site gate |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use cpu_throttle::rate_limiting::RateLimitingSettings;
///
/// let settings = RateLimitingSettings::builder()
///     .initial_rate(500.0)
///     .cooldown(Duration::from_secs(10))
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, Builder, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitingSettings {
    #[builder(default = default_initial_rate())]
    pub initial_rate: f64,

    #[builder(default = default_target_cpu_percent())]
    pub target_cpu_percent: f64,

    /// Minimum time between two committed rate adjustments. Prevents a burst of
    /// responses reporting the same transient spike from compounding.
    #[builder(default = default_cooldown())]
    #[serde(rename = "cooldown_secs", with = "duration_secs")]
    pub cooldown: Duration,

    #[builder(default = default_lower_bound())]
    pub lower_bound: f64,

    #[builder(default = default_upper_bound())]
    pub upper_bound: f64,

    /// How many seconds worth of permits may accumulate while the limiter is idle.
    /// Zero gives strictly evenly spaced permits.
    #[builder(default = default_max_burst_secs())]
    pub max_burst_secs: f64,

    /// When set, a call that cannot obtain a permit within this duration fails with
    /// [`AcquireError::TimedOut`] instead of waiting further.
    #[serde(rename = "acquire_timeout_secs", with = "duration_secs_opt")]
    pub acquire_timeout: Option<Duration>,
}

const fn default_initial_rate() -> f64 {
    10_000.0
}

const fn default_target_cpu_percent() -> f64 {
    70.0
}

const fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

const fn default_lower_bound() -> f64 {
    10.0
}

const fn default_upper_bound() -> f64 {
    100_000.0
}

const fn default_max_burst_secs() -> f64 {
    1.0
}

impl Default for RateLimitingSettings {
    fn default() -> Self {
        Self {
            initial_rate: default_initial_rate(),
            target_cpu_percent: default_target_cpu_percent(),
            cooldown: default_cooldown(),
            lower_bound: default_lower_bound(),
            upper_bound: default_upper_bound(),
            max_burst_secs: default_max_burst_secs(),
            acquire_timeout: None,
        }
    }
}

impl RateLimitingSettings {
    /// Checks the invariants the control loop relies on.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;

        if !positive(self.lower_bound)
            || !positive(self.upper_bound)
            || self.lower_bound >= self.upper_bound
        {
            return error::InvalidBoundsSnafu {
                lower: self.lower_bound,
                upper: self.upper_bound,
            }
            .fail();
        }
        if !(self.lower_bound..=self.upper_bound).contains(&self.initial_rate) {
            return error::InitialRateOutOfBoundsSnafu {
                rate: self.initial_rate,
                lower: self.lower_bound,
                upper: self.upper_bound,
            }
            .fail();
        }
        if !positive(self.target_cpu_percent) || self.target_cpu_percent > 100.0 {
            return error::InvalidTargetSnafu {
                target: self.target_cpu_percent,
            }
            .fail();
        }
        if !self.max_burst_secs.is_finite() || self.max_burst_secs < 0.0 {
            return error::InvalidBurstSnafu {
                secs: self.max_burst_secs,
            }
            .fail();
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
