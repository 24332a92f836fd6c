use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use tower::Service;

use super::{
    RateLimitingSettings,
    controller::Controller,
    error::{DeadlineExceeded, SettingsError},
    instant_now,
    stats::RateLimitingStats,
    stream::FeedbackStream,
};
use crate::Error;

/// Throttles a streaming service with the session's rate limiter and feeds the
/// responses' CPU readings back into it.
///
/// Each call waits for a permit before the inner service is called; that wait is
/// the only place back-pressure is applied. The returned stream yields exactly what
/// the inner stream yields. A call that fails with a deadline error before producing
/// a stream counts as an overload signal.
///
/// Services built over the same [`RateLimitingStats`] share one limiter.
#[derive(Clone, Debug)]
pub struct RateLimitingService<S> {
    inner: S,
    controller: Arc<Controller>,
    acquire_timeout: Option<Duration>,
}

impl<S> RateLimitingService<S> {
    /// Wraps `inner`. When `stats` is `None` a fresh session state is created from
    /// `settings`; otherwise the given state is shared and its bounds apply.
    pub fn new(
        inner: S,
        settings: RateLimitingSettings,
        stats: Option<Arc<RateLimitingStats>>,
    ) -> Result<Self, SettingsError> {
        let stats = match stats {
            Some(stats) => stats,
            None => Arc::new(RateLimitingStats::new(&settings)?),
        };
        settings.validate()?;
        Ok(Self::with_controller(
            inner,
            Arc::new(Controller::new(&settings, stats)),
            settings.acquire_timeout,
        ))
    }

    pub(crate) const fn with_controller(
        inner: S,
        controller: Arc<Controller>,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            controller,
            acquire_timeout,
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, Request, St> Service<Request> for RateLimitingService<S>
where
    S: Service<Request, Response = St> + Clone + Send + 'static,
    S::Error: Into<Error>,
    S::Future: Send + 'static,
    Request: Send + 'static,
    St: Send + 'static,
{
    type Response = FeedbackStream<St>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The instance that was polled ready goes into the future.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let controller = Arc::clone(&self.controller);
        let deadline = self.acquire_timeout.map(|timeout| instant_now() + timeout);

        Box::pin(async move {
            match deadline {
                Some(deadline) => controller.limiter().acquire_before(deadline).await?,
                None => controller.limiter().acquire().await,
            }
            match inner.call(request).await {
                Ok(stream) => Ok(FeedbackStream::new(stream, controller)),
                Err(error) => {
                    let error: Error = error.into();
                    if error.is_deadline_exceeded() {
                        controller.observe_deadline_exceeded();
                    }
                    Err(error)
                }
            }
        })
    }
}
