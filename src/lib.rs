//! Adaptive request-rate throttling driven by server CPU feedback.
//!
//! Bulk-write calls to a storage backend return a stream of responses, and each
//! response may carry the CPU utilisation of the backend locations that served it.
//! This crate wraps such a streaming call and keeps the outgoing request rate close
//! to the rate at which the busiest location sits at a target utilisation.
//!
//! # Algorithm Overview
//!
//! 1. **Gate**: every call waits for a permit from a shared [`RateLimiter`] before
//!    it is issued.
//! 2. **Feedback**: every response is forwarded untouched; its CPU samples are fed to
//!    a proportional control law, `new = current * target / max(cpu)`.
//! 3. **Commit**: a candidate is applied only when it lies within the configured
//!    bounds and the cooldown since the previous adjustment has elapsed.
//! 4. **Overload heuristic**: a deadline-exceeded stream error is treated as a
//!    reading of 99.9% CPU.
//!
//! # Basic Usage
//! ```
//! use cpu_throttle::rate_limiting::{RateLimitingLayer, RateLimitingSettings};
//!
//! let layer = RateLimitingLayer::new(RateLimitingSettings::default()).unwrap();
//! // ServiceBuilder::new().layer(layer).service(my_streaming_service)
//! assert_eq!(layer.stats().current_rate(), 10_000.0);
//! ```
//!
//! # Metrics
//! Emits metrics through the `metrics` facade, see [`rate_limiting::internal_event`].
//!
//! [`RateLimiter`]: rate_limiting::RateLimiter
pub mod rate_limiting;
#[cfg(test)]
pub(crate) mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
