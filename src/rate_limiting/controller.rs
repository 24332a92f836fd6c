use std::{sync::Arc, time::Duration};

use super::{
    RateLimitingSettings, instant_now,
    internal_event::{
        DeadlineOverload, InternalEvent, LoadObserved, RateAdjusted, RateCoolingDown,
        RateOutOfBounds,
    },
    limiter::RateLimiter,
    load::{DEADLINE_OVERLOAD_CPU, compute_new_rate},
    stats::{RateLimitingStats, Rejection},
};

/// Outcome of feeding one load signal to the [`Controller`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Adjustment {
    /// The signal carried no usable reading.
    NoSignal,
    /// The control law produced a rate outside the configured bounds.
    OutOfBounds { candidate: f64 },
    /// The previous adjustment is too recent.
    CoolingDown { candidate: f64, remaining: Duration },
    Applied { previous: f64, current: f64 },
}

impl Adjustment {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Adjustment::Applied { .. })
    }
}

/// Runs the control law against a session's shared stats and limiter.
///
/// Every in-flight call holds a clone of the `Arc`. Controllers built over the same
/// [`RateLimitingStats`] drive the same limiter.
#[derive(Debug)]
pub struct Controller {
    stats: Arc<RateLimitingStats>,
    target_cpu_percent: f64,
    cooldown: Duration,
}

impl Controller {
    pub(crate) fn new(settings: &RateLimitingSettings, stats: Arc<RateLimitingStats>) -> Self {
        Self {
            stats,
            target_cpu_percent: settings.target_cpu_percent,
            cooldown: settings.cooldown,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.stats.limiter()
    }

    pub fn stats(&self) -> &Arc<RateLimitingStats> {
        &self.stats
    }

    /// Runs one round of the control loop for the CPU readings of a response.
    pub fn observe(&self, samples: &[f64]) -> Adjustment {
        let usable = samples.iter().copied().filter(|cpu| cpu.is_finite() && *cpu > 0.0);
        let Some(max_cpu_percent) = usable.reduce(f64::max) else {
            return Adjustment::NoSignal;
        };
        LoadObserved {
            max_cpu_percent,
            locations: samples.len(),
        }
        .emit();

        let current = self.limiter().rate();
        let candidate = compute_new_rate(samples, self.target_cpu_percent, current);
        if !candidate.is_finite() {
            return Adjustment::NoSignal;
        }
        self.commit(candidate)
    }

    /// Runs one round of the control loop for a deadline-exceeded failure.
    pub fn observe_deadline_exceeded(&self) -> Adjustment {
        DeadlineOverload.emit();
        self.observe(&[DEADLINE_OVERLOAD_CPU])
    }

    fn commit(&self, candidate: f64) -> Adjustment {
        match self.stats.try_commit(candidate, instant_now(), self.cooldown) {
            Ok(previous) => {
                RateAdjusted {
                    previous: previous.current_rate,
                    current: candidate,
                }
                .emit();
                Adjustment::Applied {
                    previous: previous.current_rate,
                    current: candidate,
                }
            }
            Err(Rejection::OutOfBounds) => {
                RateOutOfBounds {
                    candidate,
                    lower_bound: self.stats.lower_bound(),
                    upper_bound: self.stats.upper_bound(),
                }
                .emit();
                Adjustment::OutOfBounds { candidate }
            }
            Err(Rejection::CoolingDown { remaining }) => {
                RateCoolingDown {
                    candidate,
                    remaining,
                }
                .emit();
                Adjustment::CoolingDown {
                    candidate,
                    remaining,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tokio::time::advance;

    use super::*;

    fn controller(initial: f64, lower: f64, upper: f64) -> Controller {
        let settings = RateLimitingSettings::builder()
            .initial_rate(initial)
            .lower_bound(lower)
            .upper_bound(upper)
            .build();
        let stats = Arc::new(RateLimitingStats::new(&settings).unwrap());
        Controller::new(&settings, stats)
    }

    fn applied_rate(adjustment: Adjustment) -> f64 {
        match adjustment {
            Adjustment::Applied { current, .. } => current,
            other => panic!("expected an applied adjustment, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn low_cpu_raises_rate() {
        let controller = controller(100.0, 10.0, 10_000.0);
        let rate = applied_rate(controller.observe(&[40.1, 10.1, 36.2]));

        assert!((rate - 174.56).abs() < 0.01);
        assert_eq!(controller.limiter().rate(), rate);
        assert_eq!(controller.stats().current_rate(), rate);
    }

    #[tokio::test(start_paused = true)]
    async fn high_cpu_lowers_rate() {
        let controller = controller(100.0, 10.0, 10_000.0);
        let rate = applied_rate(controller.observe(&[90.1, 80.1, 76.2]));

        assert!((rate - 77.69).abs() < 0.01);
        assert_eq!(controller.limiter().rate(), rate);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_drives_rate_down() {
        let controller = controller(100.0, 10.0, 10_000.0);
        let rate = applied_rate(controller.observe_deadline_exceeded());

        assert!((rate - 70.07).abs() < 0.01);
        assert_eq!(controller.stats().current_rate(), rate);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sample_does_not_consume_cooldown() {
        let controller = controller(100.0, 10.0, 10_000.0);

        assert_eq!(controller.observe(&[]), Adjustment::NoSignal);
        assert_eq!(controller.stats().last_update(), None);
        assert!(controller.observe(&[35.0]).is_applied());
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_readings_are_no_signal() {
        let controller = controller(100.0, 10.0, 10_000.0);

        assert_eq!(controller.observe(&[f64::NAN, 0.0]), Adjustment::NoSignal);
        assert_eq!(controller.stats().last_update(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_bounds_candidate_leaves_state_alone() {
        let controller = controller(9_000.0, 10.0, 10_000.0);

        let adjustment = controller.observe(&[35.0]);
        assert_eq!(adjustment, Adjustment::OutOfBounds { candidate: 18_000.0 });
        assert_eq!(controller.limiter().rate(), 9_000.0);
        assert_eq!(controller.stats().current_rate(), 9_000.0);
        assert_eq!(controller.stats().last_update(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_near_floor_is_not_applied() {
        let controller = controller(12.0, 10.0, 10_000.0);

        assert!(matches!(
            controller.observe_deadline_exceeded(),
            Adjustment::OutOfBounds { .. }
        ));
        assert_eq!(controller.stats().current_rate(), 12.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_debounces_successive_signals() {
        let controller = controller(100.0, 10.0, 10_000.0);

        assert!(controller.observe(&[35.0]).is_applied());
        advance(Duration::from_secs(30)).await;
        assert!(matches!(
            controller.observe(&[95.0]),
            Adjustment::CoolingDown { remaining, .. } if remaining == Duration::from_secs(30)
        ));
        assert_eq!(controller.limiter().rate(), 200.0);

        advance(Duration::from_secs(30)).await;
        let rate = applied_rate(controller.observe(&[100.0]));
        assert!((rate - 140.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let controller = controller(100.0, 10.0, 10_000.0);

        metrics::with_local_recorder(&recorder, || {
            controller.observe(&[35.0]);
            controller.observe(&[35.0]);
            controller.observe_deadline_exceeded();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let counter = |name: &str| {
            snapshot
                .iter()
                .filter(|(key, ..)| key.key().name() == name)
                .map(|(.., value)| match value {
                    DebugValue::Counter(n) => *n,
                    other => panic!("{name} is not a counter: {other:?}"),
                })
                .sum::<u64>()
        };

        assert_eq!(counter("cpu_throttle_adjustments_total"), 1);
        assert_eq!(counter("cpu_throttle_deadline_signals_total"), 1);
        assert_eq!(counter("cpu_throttle_adjustments_skipped_total"), 2);
        assert_eq!(
            snapshot
                .iter()
                .filter(|(key, ..)| key.key().name() == "cpu_throttle_rate")
                .count(),
            1
        );
    }
}
