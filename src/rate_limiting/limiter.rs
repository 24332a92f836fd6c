use std::{
    future::Future,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use snafu::ensure;
use tokio::time::{Instant, sleep_until};

use super::{
    error::{AcquireError, InvalidBurstSnafu, InvalidRateSnafu, SettingsError},
    instant_now,
};

/// A token bucket with a mutable refill rate.
///
/// Tokens refill continuously at `rate` per second, up to `max(1, max_burst_secs *
/// rate)`. A caller that finds the bucket empty takes a token on credit and sleeps
/// until the debt is repaid, so waiters are served in reservation order and evenly
/// spaced.
///
/// The rate lives in an atomic outside of the bucket lock, so [`set_rate`] can be
/// called from any number of response handlers without contending with callers
/// waiting in [`acquire`]. A new rate governs refill from the next reservation
/// onwards; waiters that already reserved keep their wake-up time.
///
/// [`set_rate`]: RateLimiter::set_rate
/// [`acquire`]: RateLimiter::acquire
#[derive(Debug)]
pub struct RateLimiter {
    rate_bits: AtomicU64,
    max_burst_secs: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    // Negative while callers are waiting on credit.
    tokens: f64,
    last_refill: Instant,
}

/// A token taken from the bucket whose wait has not finished yet. Dropping it
/// before [`wait`](Reservation::wait) completes puts the token back.
#[must_use]
struct Reservation<'a> {
    limiter: &'a RateLimiter,
    ready_at: Instant,
    pending: bool,
}

impl Reservation<'_> {
    async fn wait(mut self) {
        if self.ready_at > instant_now() {
            sleep_until(self.ready_at).await;
        }
        self.pending = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.pending {
            self.limiter.release();
        }
    }
}

impl RateLimiter {
    /// Creates a limiter refilling at `rate` permits per second that stores up to
    /// `max_burst_secs` worth of permits while idle.
    pub fn new(rate: f64, max_burst_secs: f64) -> Result<Self, SettingsError> {
        ensure!(rate.is_finite() && rate > 0.0, InvalidRateSnafu { rate });
        ensure!(
            max_burst_secs.is_finite() && max_burst_secs >= 0.0,
            InvalidBurstSnafu {
                secs: max_burst_secs
            }
        );
        Ok(Self {
            rate_bits: AtomicU64::new(rate.to_bits()),
            max_burst_secs,
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: instant_now(),
            }),
        })
    }

    /// The rate last passed to [`set_rate`](RateLimiter::set_rate), in permits per second.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    /// Changes the refill rate. Non-finite or non-positive rates are ignored.
    pub fn set_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            warn!(message = "Ignoring invalid rate limiter rate.", rate);
            return;
        }
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }

    /// Waits until a permit is available. Never fails; dropping the future before it
    /// completes gives the permit back.
    pub async fn acquire(&self) {
        self.reserve(instant_now()).wait().await;
    }

    /// Like [`acquire`](RateLimiter::acquire), but gives up as soon as `cancel`
    /// completes. A cancelled wait gives its permit back.
    pub async fn acquire_with_cancel<F>(&self, cancel: F) -> Result<(), AcquireError>
    where
        F: Future<Output = ()>,
    {
        let reservation = self.reserve(instant_now());
        if !reservation.pending {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = reservation.wait() => Ok(()),
            () = cancel => Err(AcquireError::Cancelled),
        }
    }

    /// Like [`acquire`](RateLimiter::acquire), but fails right away if the permit
    /// would only be granted after `deadline`. Nothing is reserved in that case.
    pub async fn acquire_before(&self, deadline: Instant) -> Result<(), AcquireError> {
        self.reserve_if(instant_now(), |ready_at| ready_at <= deadline)
            .ok_or(AcquireError::TimedOut)?
            .wait()
            .await;
        Ok(())
    }

    /// Takes a permit only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let now = instant_now();
        self.reserve_if(now, |ready_at| ready_at <= now).is_some()
    }

    fn reserve(&self, now: Instant) -> Reservation<'_> {
        self.reserve_if(now, |_| true).unwrap_or(Reservation {
            limiter: self,
            ready_at: now,
            pending: false,
        })
    }

    /// Takes a token and returns the instant at which it may be used, unless `accept`
    /// rejects that instant.
    fn reserve_if(
        &self,
        now: Instant,
        accept: impl FnOnce(Instant) -> bool,
    ) -> Option<Reservation<'_>> {
        let rate = self.rate();
        let capacity = (self.max_burst_secs * rate).max(1.0);
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        // `now` was read before the lock, so another caller may already be ahead of it.
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = bucket.last_refill.max(now);

        let ready_at = if bucket.tokens >= 1.0 {
            now
        } else {
            now + Duration::from_secs_f64((1.0 - bucket.tokens) / rate)
        };
        if !accept(ready_at) {
            return None;
        }

        bucket.tokens -= 1.0;
        Some(Reservation {
            limiter: self,
            ready_at,
            pending: ready_at > now,
        })
    }

    // Returns the token of an abandoned reservation.
    fn release(&self) {
        let capacity = (self.max_burst_secs * self.rate()).max(1.0);
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.tokens = (bucket.tokens + 1.0).min(capacity);
    }
}
