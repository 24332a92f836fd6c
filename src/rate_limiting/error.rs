use snafu::Snafu;
use tower::timeout::error::Elapsed;

use crate::Error as CrateError;

/// Failures a streaming call can report through its response stream.
///
/// Inner services are free to use their own error type; this one is provided for
/// transports that have nothing better, and for tests.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CallError {
    /// The call did not finish before its deadline.
    #[snafu(display("deadline exceeded: {message}"))]
    DeadlineExceeded { message: String },

    /// The backend is temporarily unable to serve the call.
    #[snafu(display("service unavailable: {message}"))]
    Unavailable { message: String },

    /// The call was rejected, e.g. because it was malformed.
    #[snafu(display("call rejected (code {code}): {message}"))]
    Rejected { code: i32, message: String },

    /// The underlying transport failed.
    #[snafu(display("transport error: {source}"))]
    Transport { source: CrateError },
}

/// Errors from waiting on the call-site gate.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum AcquireError {
    #[snafu(display("rate limiter acquire was cancelled"))]
    Cancelled,

    #[snafu(display("timed out waiting for a rate limiter permit"))]
    TimedOut,
}

#[derive(Debug, Snafu, Clone, Copy, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("rate bounds must satisfy 0 < lower < upper, got [{lower}, {upper}]"))]
    InvalidBounds { lower: f64, upper: f64 },

    #[snafu(display("initial rate {rate} is outside [{lower}, {upper}]"))]
    InitialRateOutOfBounds { rate: f64, lower: f64, upper: f64 },

    #[snafu(display("target cpu must be within (0, 100], got {target}"))]
    InvalidTarget { target: f64 },

    #[snafu(display("rate must be a positive number of permits per second, got {rate}"))]
    InvalidRate { rate: f64 },

    #[snafu(display("max burst must be a non-negative number of seconds, got {secs}"))]
    InvalidBurst { secs: f64 },
}

/// Classifies a stream error as a deadline failure.
///
/// Deadline failures are taken as a sign that the backend is saturated, and push the
/// rate towards the lower bound.
pub trait DeadlineExceeded {
    fn is_deadline_exceeded(&self) -> bool;
}

impl DeadlineExceeded for CallError {
    fn is_deadline_exceeded(&self) -> bool {
        matches!(self, CallError::DeadlineExceeded { .. })
    }
}

impl DeadlineExceeded for Elapsed {
    fn is_deadline_exceeded(&self) -> bool {
        true
    }
}

impl DeadlineExceeded for CrateError {
    fn is_deadline_exceeded(&self) -> bool {
        if let Some(call) = self.downcast_ref::<CallError>() {
            call.is_deadline_exceeded()
        } else {
            self.downcast_ref::<Elapsed>().is_some()
        }
    }
}
