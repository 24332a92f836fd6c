use std::{sync::Arc, time::Duration};

use tower::Layer;

use super::{
    RateLimitingSettings, controller::Controller, error::SettingsError, limiter::RateLimiter,
    service::RateLimitingService, stats::RateLimitingStats,
};

/// Enforces a CPU-feedback driven rate limit on the wrapped streaming services.
///
/// All services produced by one layer share a single limiter and a single
/// [`RateLimitingStats`], so build one layer per client session.
#[derive(Clone, Debug)]
pub struct RateLimitingLayer {
    controller: Arc<Controller>,
    acquire_timeout: Option<Duration>,
}

impl RateLimitingLayer {
    /// Creates a layer with fresh session state.
    pub fn new(settings: RateLimitingSettings) -> Result<Self, SettingsError> {
        let stats = Arc::new(RateLimitingStats::new(&settings)?);
        Ok(Self::from_parts(&settings, stats))
    }

    /// Creates a layer around caller-owned session state. The bounds and current rate
    /// of `stats` take precedence over those in `settings`.
    pub fn with_stats(
        settings: RateLimitingSettings,
        stats: Arc<RateLimitingStats>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self::from_parts(&settings, stats))
    }

    fn from_parts(settings: &RateLimitingSettings, stats: Arc<RateLimitingStats>) -> Self {
        Self {
            controller: Arc::new(Controller::new(settings, stats)),
            acquire_timeout: settings.acquire_timeout,
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.controller.limiter()
    }

    pub fn stats(&self) -> &Arc<RateLimitingStats> {
        self.controller.stats()
    }
}

impl<S> Layer<S> for RateLimitingLayer {
    type Service = RateLimitingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitingService::with_controller(
            service,
            Arc::clone(&self.controller),
            self.acquire_timeout,
        )
    }
}
