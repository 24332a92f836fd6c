use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use super::{RateLimitingSettings, error::SettingsError, limiter::RateLimiter};

/// Session-wide record of the permitted rate, shared by every call issued through
/// the same client.
///
/// The rate and the time of the last adjustment are kept behind one lock so that a
/// reader never sees one without the other. `lower_bound <= current_rate <=
/// upper_bound` holds after every mutation.
///
/// The session's [`RateLimiter`] lives here too and is retuned inside the same
/// critical section, so every service sharing these stats throttles at
/// `current_rate`.
#[derive(Debug)]
pub struct RateLimitingStats {
    lower_bound: f64,
    upper_bound: f64,
    limiter: Arc<RateLimiter>,
    state: Mutex<StatsSnapshot>,
}

/// A consistent view of the mutable part of [`RateLimitingStats`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsSnapshot {
    pub current_rate: f64,
    /// `None` until the first adjustment is committed.
    pub last_update: Option<Instant>,
}

/// Why [`RateLimitingStats::try_commit`] refused a candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Rejection {
    OutOfBounds,
    CoolingDown { remaining: Duration },
}

impl RateLimitingStats {
    pub fn new(settings: &RateLimitingSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let limiter = RateLimiter::new(settings.initial_rate, settings.max_burst_secs)?;
        Ok(Self {
            lower_bound: settings.lower_bound,
            upper_bound: settings.upper_bound,
            limiter: Arc::new(limiter),
            state: Mutex::new(StatsSnapshot {
                current_rate: settings.initial_rate,
                last_update: None,
            }),
        })
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn current_rate(&self) -> f64 {
        self.snapshot().current_rate
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.snapshot().last_update
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, rate: f64) -> bool {
        (self.lower_bound..=self.upper_bound).contains(&rate)
    }

    /// Records `candidate` as the new rate if it lies within the bounds and at least
    /// `cooldown` has passed since the previous commit. Both checks and the update
    /// happen under one lock, so concurrent callers commit at most once per window.
    pub(crate) fn try_commit(
        &self,
        candidate: f64,
        now: Instant,
        cooldown: Duration,
    ) -> Result<StatsSnapshot, Rejection> {
        if !self.contains(candidate) {
            return Err(Rejection::OutOfBounds);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = state.last_update {
            let since = now.saturating_duration_since(last);
            if since < cooldown {
                return Err(Rejection::CoolingDown {
                    remaining: cooldown - since,
                });
            }
        }

        let previous = *state;
        self.limiter.set_rate(candidate);
        *state = StatsSnapshot {
            current_rate: candidate,
            last_update: Some(now),
        };
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(lower: f64, upper: f64, initial: f64) -> RateLimitingStats {
        let settings = RateLimitingSettings::builder()
            .lower_bound(lower)
            .upper_bound(upper)
            .initial_rate(initial)
            .build();
        RateLimitingStats::new(&settings).unwrap()
    }

    #[test]
    fn starts_at_initial_rate_without_update() {
        let stats = stats(10.0, 10_000.0, 100.0);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                current_rate: 100.0,
                last_update: None,
            }
        );
    }

    #[test]
    fn rejects_invalid_settings() {
        let settings = RateLimitingSettings::builder()
            .lower_bound(0.0)
            .upper_bound(10.0)
            .initial_rate(5.0)
            .build();
        assert!(RateLimitingStats::new(&settings).is_err());
    }

    #[test]
    fn out_of_bounds_candidate_does_not_mutate() {
        let stats = stats(10.0, 10_000.0, 100.0);
        let now = Instant::now();

        assert_eq!(
            stats.try_commit(9.99, now, Duration::ZERO),
            Err(Rejection::OutOfBounds)
        );
        assert_eq!(
            stats.try_commit(10_000.01, now, Duration::ZERO),
            Err(Rejection::OutOfBounds)
        );
        assert_eq!(stats.current_rate(), 100.0);
        assert_eq!(stats.limiter().rate(), 100.0);
        assert_eq!(stats.last_update(), None);
    }

    #[test]
    fn bounds_are_inclusive() {
        let stats = stats(10.0, 10_000.0, 100.0);
        let now = Instant::now();
        assert!(stats.try_commit(10.0, now, Duration::ZERO).is_ok());
        assert!(stats.try_commit(10_000.0, now, Duration::ZERO).is_ok());
        assert_eq!(stats.current_rate(), 10_000.0);
        assert_eq!(stats.limiter().rate(), 10_000.0);
    }

    #[test]
    fn cooldown_allows_one_commit_per_window() {
        let stats = stats(10.0, 10_000.0, 100.0);
        let cooldown = Duration::from_secs(60);
        let t0 = Instant::now();

        let previous = stats.try_commit(174.6, t0, cooldown).unwrap();
        assert_eq!(previous.current_rate, 100.0);

        assert_eq!(
            stats.try_commit(77.7, t0 + Duration::from_secs(59), cooldown),
            Err(Rejection::CoolingDown {
                remaining: Duration::from_secs(1)
            })
        );
        assert_eq!(stats.current_rate(), 174.6);
        assert_eq!(stats.last_update(), Some(t0));

        let t1 = t0 + Duration::from_secs(60);
        assert!(stats.try_commit(77.7, t1, cooldown).is_ok());
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                current_rate: 77.7,
                last_update: Some(t1),
            }
        );
    }

    #[test]
    fn concurrent_commits_within_window_commit_once() {
        let stats = std::sync::Arc::new(stats(10.0, 10_000.0, 100.0));
        let now = Instant::now();

        let committed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16_i32)
                .map(|i| {
                    let stats = &stats;
                    scope.spawn(move || {
                        stats
                            .try_commit(50.0 + f64::from(i), now, Duration::from_secs(60))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(committed, 1);
    }
}
