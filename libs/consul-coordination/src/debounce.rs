//! Debouncing stream adapter.
//!
//! Holds back values until the upstream has been quiet for a full quiet
//! period, so a flapping health check produces one settled membership
//! instead of a burst of rebalances. Every upstream value replaces the
//! pending candidate and restarts the timer; the timer is not additive.
//!
//! When the upstream ends, an unsettled candidate is dropped with the timer.

use std::{
    pin::Pin,
    task::{self, Poll},
    time::Duration,
};

use futures::Future;
use pin_project::pin_project;
use tokio::time::{Instant, Sleep};
use tokio_stream::Stream;
use tracing::debug;

use crate::metrics;

/// Stream returned by [`debounce`]. Dropping it, or the upstream ending,
/// cancels the pending timer.
///
/// `Unpin` whenever the upstream is.
#[pin_project]
#[derive(Debug)]
pub struct Debounced<S: Stream> {
    #[pin]
    upstream: S,
    timer: Pin<Box<Sleep>>,
    pending: Option<S::Item>,
    quiet_period: Duration,
    upstream_done: bool,
}

/// Debounce `upstream` with the given quiet period.
///
/// Must be called from within a tokio runtime.
pub fn debounce<S: Stream>(upstream: S, quiet_period: Duration) -> Debounced<S> {
    Debounced {
        upstream,
        timer: Box::pin(tokio::time::sleep(quiet_period)),
        pending: None,
        quiet_period,
        upstream_done: false,
    }
}

impl<S: Stream> Debounced<S> {
    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.upstream
    }
}

impl<S: Stream> Stream for Debounced<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // drain everything the upstream has ready, keeping only the newest
        while !*this.upstream_done {
            match this.upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(value)) => {
                    *this.pending = Some(value);
                    this.timer.as_mut().reset(deadline(*this.quiet_period));
                }
                Poll::Ready(None) => *this.upstream_done = true,
                Poll::Pending => break,
            }
        }

        if *this.upstream_done {
            // never settled, so never emitted
            if let Some(_dropped) = this.pending.take() {
                debug!(quiet_period = ?this.quiet_period, "upstream ended, dropping unsettled value");
            }
            return Poll::Ready(None);
        }

        if this.pending.is_some() && this.timer.as_mut().poll(cx).is_ready() {
            metrics::DEBOUNCE_EMISSIONS.inc();
            return Poll::Ready(this.pending.take());
        }

        Poll::Pending
    }
}

/// `now + quiet_period`, saturating far in the future like `tokio::time::sleep`.
fn deadline(quiet_period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(quiet_period)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// About 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
