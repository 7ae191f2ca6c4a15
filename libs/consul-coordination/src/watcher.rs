//! Change watcher: drives one blocking query source forever and turns its
//! results into a sequence of distinct values.
//!
//! ```text
//! Starting ─> Polling ─┬─> Delivering ─┐
//!               ^      └─> Backoff ────┤
//!               └──────────────────────┘        (cancel) ─> Stopped
//! ```
//!
//! Deduplication is by content, not by index: Consul may bump the index of a
//! key without changing its value, and a response after the wait elapses
//! carries the old index and value. Transport failures are retried with
//! capped exponential backoff and jitter; subscribers only see them through
//! [`WatchStatus`].

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use config::WatchConfig;

use crate::metrics;
use crate::models::{QueryIdentity, QueryOutcome, VersionedValue};
use crate::source::BlockingQuerySource;

/// Backoff applied between failed blocking queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&WatchConfig> for RetryPolicy {
    fn from(config: &WatchConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    /// [`delay`](Self::delay) with jitter, uniformly in `[delay / 2, delay]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let half = delay / 2;
        let spread = (delay - half).as_millis() as u64;
        if spread == 0 {
            return delay;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Liveness of a watch as seen by its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// No response received yet.
    Starting,
    /// The last query succeeded.
    Live,
    /// Queries are failing; values may be stale.
    Stale { consecutive_failures: u32 },
}

/// Drives one [`BlockingQuerySource`].
pub struct ChangeWatcher<S: BlockingQuerySource> {
    identity: QueryIdentity,
    source: S,
    retry: RetryPolicy,
    status: watch::Sender<WatchStatus>,
    index: u64,
    last: Option<S::Value>,
}

impl<S: BlockingQuerySource> std::fmt::Debug for ChangeWatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("identity", &self.identity)
            .field("retry", &self.retry)
            .field("index", &self.index)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl<S: BlockingQuerySource> ChangeWatcher<S> {
    /// New watcher starting from "no index".
    pub fn new(source: S, retry: RetryPolicy) -> Self {
        let (status, _) = watch::channel(WatchStatus::Starting);
        Self {
            identity: source.identity(),
            source,
            retry,
            status,
            index: 0,
            last: None,
        }
    }

    /// Receiver for the liveness signal of this watcher.
    pub fn status(&self) -> watch::Receiver<WatchStatus> {
        self.status.subscribe()
    }

    /// Poll until `cancel` fires, handing every distinct value to `deliver`
    /// in the order the backend reported them.
    ///
    /// Cancellation drops the in-flight query, which closes its connection.
    pub async fn run<F>(mut self, cancel: CancellationToken, mut deliver: F)
    where
        F: FnMut(S::Value) + Send,
    {
        info!(identity = %self.identity, "watch started");
        let mut failures: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.source.query(self.index) => outcome,
            };

            match outcome {
                Ok(QueryOutcome::NoResponse) => {
                    debug!(identity = %self.identity, index = self.index, "no response within wait");
                }
                Ok(QueryOutcome::Response(result)) => {
                    if failures > 0 {
                        info!(identity = %self.identity, failures, "watch recovered");
                        failures = 0;
                    }
                    self.status.send_replace(WatchStatus::Live);
                    if let Some(value) = self.observe(result) {
                        deliver(value);
                    }
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    metrics::WATCH_QUERY_FAILURES.inc();
                    self.status.send_replace(WatchStatus::Stale {
                        consecutive_failures: failures,
                    });
                    let delay = self.retry.jittered_delay(failures);
                    if err.is_retryable() {
                        warn!(
                            identity = %self.identity,
                            attempt = failures,
                            retry_in_ms = delay.as_millis(),
                            error = %err,
                            "blocking query failed, backing off"
                        );
                    } else {
                        error!(
                            identity = %self.identity,
                            attempt = failures,
                            retry_in_ms = delay.as_millis(),
                            error = %err,
                            "blocking query failed permanently"
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(identity = %self.identity, index = self.index, "watch stopped");
    }

    /// Record a response; returns the value if its content is new.
    fn observe(&mut self, result: VersionedValue<S::Value>) -> Option<S::Value> {
        let VersionedValue { value, index } = result;
        let moved = index != self.index;
        self.index = match index {
            // a zero index would turn the next query into a busy loop
            0 => 1,
            i if i < self.index => {
                debug!(identity = %self.identity, old = self.index, new = i, "index went backwards, resetting");
                0
            }
            i => i,
        };

        if self.last.as_ref() == Some(&value) {
            trace!(identity = %self.identity, index, "content unchanged");
            if moved {
                metrics::WATCH_DUPLICATES_SUPPRESSED.inc();
            }
            return None;
        }

        debug!(identity = %self.identity, index, ?value, "delivering change");
        metrics::WATCH_DELIVERIES.inc();
        self.last = Some(value.clone());
        Some(value)
    }
}
