//! Metrics and log events emitted by the control loop.
//!
//! | Metric | Kind | Description |
//! |--------|------|-------------|
//! | `cpu_throttle_rate` | gauge | Permitted requests per second after each commit |
//! | `cpu_throttle_observed_cpu` | histogram | Busiest location's CPU per response |
//! | `cpu_throttle_adjustments_total` | counter | Committed rate changes |
//! | `cpu_throttle_adjustments_skipped_total` | counter | Candidates not applied, by `reason` |
//! | `cpu_throttle_deadline_signals_total` | counter | Deadline failures treated as overload |
use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub trait InternalEvent: Sized {
    fn emit(self);
}

#[derive(Clone, Copy, Debug)]
pub struct LoadObserved {
    pub max_cpu_percent: f64,
    pub locations: usize,
}

impl InternalEvent for LoadObserved {
    fn emit(self) {
        histogram!("cpu_throttle_observed_cpu").record(self.max_cpu_percent);
        trace!(
            target: "cpu_throttle::stats",
            max_cpu_percent = self.max_cpu_percent,
            locations = self.locations,
            "Load observed."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateAdjusted {
    pub previous: f64,
    pub current: f64,
}

impl InternalEvent for RateAdjusted {
    fn emit(self) {
        gauge!("cpu_throttle_rate").set(self.current);
        counter!("cpu_throttle_adjustments_total").increment(1);
        info!(
            target: "cpu_throttle::stats",
            previous_rate = self.previous,
            new_rate = self.current,
            "Rate adjusted."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateOutOfBounds {
    pub candidate: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl InternalEvent for RateOutOfBounds {
    fn emit(self) {
        counter!("cpu_throttle_adjustments_skipped_total", "reason" => "out_of_bounds")
            .increment(1);
        debug!(
            target: "cpu_throttle::stats",
            candidate = self.candidate,
            lower_bound = self.lower_bound,
            upper_bound = self.upper_bound,
            "Calculated rate is not within bounds; keeping current rate."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateCoolingDown {
    pub candidate: f64,
    pub remaining: Duration,
}

impl InternalEvent for RateCoolingDown {
    fn emit(self) {
        counter!("cpu_throttle_adjustments_skipped_total", "reason" => "cooldown").increment(1);
        trace!(
            target: "cpu_throttle::stats",
            candidate = self.candidate,
            remaining_ms = self.remaining.as_millis(),
            "Rate adjustment skipped during cooldown."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeadlineOverload;

impl InternalEvent for DeadlineOverload {
    fn emit(self) {
        counter!("cpu_throttle_deadline_signals_total").increment(1);
        warn!(
            target: "cpu_throttle::stats",
            "Deadline exceeded; treating backend as overloaded."
        );
    }
}
