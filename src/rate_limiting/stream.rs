use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use pin_project::pin_project;

use super::{
    controller::{Adjustment, Controller},
    error::DeadlineExceeded,
    load::{LoadReport, extract_load},
};

/// Lifecycle of one streaming call as seen by its [`FeedbackStream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Started,
    Active,
    Completed,
    Errored,
}

impl CallState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Errored)
    }
}

/// Wraps the response stream of one call.
///
/// Every item is handed to the consumer exactly as the inner stream produced it.
/// Alongside, each response's CPU readings and each deadline failure are fed to the
/// session's [`Controller`]. The control loop never fails the call; at worst a round
/// results in no adjustment.
#[pin_project]
#[derive(Debug)]
pub struct FeedbackStream<St> {
    #[pin]
    inner: St,
    controller: Arc<Controller>,
    state: CallState,
}

impl<St> FeedbackStream<St> {
    pub(crate) fn new(inner: St, controller: Arc<Controller>) -> Self {
        trace!(target: "cpu_throttle::stats", "Streaming call started.");
        Self {
            inner,
            controller,
            state: CallState::Started,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn into_inner(self) -> St {
        self.inner
    }
}

impl<St, T, E> Stream for FeedbackStream<St>
where
    St: Stream<Item = Result<T, E>>,
    T: LoadReport,
    E: DeadlineExceeded,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = std::task::ready!(this.inner.poll_next(cx));

        if this.state.is_terminal() {
            return Poll::Ready(item);
        }

        match &item {
            Some(Ok(response)) => {
                *this.state = CallState::Active;
                let adjustment = this.controller.observe(&extract_load(response));
                trace_adjustment(adjustment);
            }
            Some(Err(error)) => {
                *this.state = CallState::Errored;
                if error.is_deadline_exceeded() {
                    let adjustment = this.controller.observe_deadline_exceeded();
                    trace_adjustment(adjustment);
                }
            }
            None => {
                *this.state = CallState::Completed;
                trace!(target: "cpu_throttle::stats", "Streaming call completed.");
            }
        }

        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

fn trace_adjustment(adjustment: Adjustment) {
    if !matches!(adjustment, Adjustment::NoSignal) {
        trace!(target: "cpu_throttle::stats", ?adjustment, "Control loop round finished.");
    }
}
