//! Shared watch registry.
//!
//! Keeps at most one [`ChangeWatcher`] per [`QueryIdentity`] and fans its
//! values out to every subscriber. A late subscriber first receives the most
//! recent value (if any), then live changes. When the last subscriber goes
//! away the loop is cancelled and the entry removed; a later subscription
//! starts a fresh loop from "no index".
//!
//! Create, attach, detach and remove all happen under one lock, so two
//! concurrent first subscribers can never start two loops.

use std::{
    collections::{HashMap, hash_map::Entry as Slot},
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    task::{self, Poll},
};

use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::{
    Stream, StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_futures::Instrument;

use crate::{
    error::{CoordinationError, CoordinationResult},
    metrics,
    models::QueryIdentity,
    source::BlockingQuerySource,
    watcher::{ChangeWatcher, RetryPolicy, WatchStatus},
};

/// Default per-subscriber buffer. A subscriber more than this many values
/// behind skips the oldest ones.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

/// Registry of running watches producing values of type `V`.
#[derive(Debug)]
pub struct WatchRegistry<V> {
    inner: Arc<RegistryInner<V>>,
}

impl<V> Clone for WatchRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
struct RegistryInner<V> {
    entries: Mutex<HashMap<QueryIdentity, Entry<V>>>,
    shutdown: CancellationToken,
    retry: RetryPolicy,
    buffer: usize,
    next_generation: AtomicU64,
    watchers_started: AtomicU64,
    running: Arc<AtomicUsize>,
}

impl<V> Drop for RegistryInner<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
struct Entry<V> {
    generation: u64,
    subscribers: usize,
    shared: Arc<EntryShared<V>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct EntryShared<V> {
    last: Mutex<Option<V>>,
    tx: broadcast::Sender<V>,
    status: watch::Receiver<WatchStatus>,
}

impl<V: Clone> EntryShared<V> {
    fn publish(&self, value: V) {
        let mut last = self.last.lock();
        *last = Some(value.clone());
        // no receivers is fine, the value is kept for replay
        let _ = self.tx.send(value);
    }

    /// Snapshot of the current value plus a receiver for everything after it.
    fn attach(&self) -> (Option<V>, broadcast::Receiver<V>) {
        let last = self.last.lock();
        (last.clone(), self.tx.subscribe())
    }
}

/// Decrements the running-watch counters when a loop task ends.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn new(running: Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        metrics::WATCHES_ACTIVE.inc();
        Self(running)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::WATCHES_ACTIVE.dec();
    }
}

impl<V> Default for WatchRegistry<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl<V> WatchRegistry<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(retry: RetryPolicy, buffer: usize) -> Self {
        Self::with_shutdown(retry, buffer, CancellationToken::new())
    }

    /// Registry whose loops also stop when `parent` is cancelled.
    pub fn with_shutdown(retry: RetryPolicy, buffer: usize, parent: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                shutdown: parent.child_token(),
                retry,
                buffer: buffer.max(1),
                next_generation: AtomicU64::new(1),
                watchers_started: AtomicU64::new(0),
                running: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Subscribe to `identity`, starting a loop over the source built by
    /// `make_source` if none is running. Never blocks: the stream yields the
    /// current value first when one is known.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch<S, F>(&self, identity: QueryIdentity, make_source: F) -> CoordinationResult<WatchStream<V>>
    where
        S: BlockingQuerySource<Value = V>,
        F: FnOnce() -> S,
    {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(CoordinationError::Closed);
        }

        let mut entries = inner.entries.lock();
        let entry = match entries.entry(identity.clone()) {
            Slot::Occupied(slot) => {
                let entry = slot.into_mut();
                entry.subscribers += 1;
                debug!(%identity, subscribers = entry.subscribers, "subscriber attached");
                entry
            }
            Slot::Vacant(slot) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|err| CoordinationError::Config(format!("no tokio runtime: {err}")))?;
                slot.insert(self.start(&runtime, identity.clone(), make_source()))
            }
        };

        let (initial, rx) = entry.shared.attach();
        Ok(WatchStream {
            initial,
            inner: BroadcastStream::new(rx),
            status: entry.shared.status.clone(),
            handle: WatchHandle {
                registry: Arc::downgrade(inner),
                identity,
                generation: entry.generation,
            },
        })
    }

    /// Like [`watch`](Self::watch) but waits for the first value, so the
    /// caller always starts from the current state.
    pub async fn subscribe<S, F>(&self, identity: QueryIdentity, make_source: F) -> CoordinationResult<(V, WatchStream<V>)>
    where
        S: BlockingQuerySource<Value = V>,
        F: FnOnce() -> S,
    {
        let mut stream = self.watch(identity, make_source)?;
        let first = stream.recv().await.ok_or(CoordinationError::Closed)?;
        Ok((first, stream))
    }

    fn start<S>(&self, runtime: &tokio::runtime::Handle, identity: QueryIdentity, source: S) -> Entry<V>
    where
        S: BlockingQuerySource<Value = V>,
    {
        let inner = &self.inner;
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let watcher = ChangeWatcher::new(source, inner.retry);
        let (tx, _) = broadcast::channel(inner.buffer);
        let shared = Arc::new(EntryShared {
            last: Mutex::new(None),
            tx,
            status: watcher.status(),
        });
        let cancel = inner.shutdown.child_token();

        inner.watchers_started.fetch_add(1, Ordering::SeqCst);
        metrics::WATCHES_STARTED.inc();
        info!(%identity, generation, "starting watch");

        let guard = RunningGuard::new(Arc::clone(&inner.running));
        let publisher = Arc::clone(&shared);
        let task = runtime.spawn(
            {
                let cancel = cancel.clone();
                async move {
                    let _guard = guard;
                    watcher.run(cancel, move |value| publisher.publish(value)).await;
                }
            }
            .instrument(tracing::debug_span!("watch", %identity, generation)),
        );

        Entry {
            generation,
            subscribers: 1,
            shared,
            cancel,
            task,
        }
    }

    fn release(inner: &RegistryInner<V>, identity: &QueryIdentity, generation: u64) {
        let mut entries = inner.entries.lock();
        let Some(entry) = entries.get_mut(identity) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.subscribers = entry.subscribers.saturating_sub(1);
        debug!(%identity, subscribers = entry.subscribers, "subscriber detached");
        if entry.subscribers == 0 {
            if let Some(entry) = entries.remove(identity) {
                info!(%identity, generation, "last subscriber gone, stopping watch");
                entry.cancel.cancel();
            }
        }
    }

    /// Identities with a running loop.
    pub fn active_watchers(&self) -> Vec<QueryIdentity> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, identity: &QueryIdentity) -> usize {
        self.inner
            .entries
            .lock()
            .get(identity)
            .map_or(0, |entry| entry.subscribers)
    }

    /// Total loops started over the registry's lifetime.
    pub fn watchers_started(&self) -> u64 {
        self.inner.watchers_started.load(Ordering::SeqCst)
    }

    /// Loop tasks that have not yet exited, including ones still unwinding
    /// after cancellation.
    pub fn running_watchers(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every loop and wait for them to exit. Open streams end after
    /// draining what they already received; later subscriptions fail with
    /// [`CoordinationError::Closed`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<_> = self.inner.entries.lock().drain().collect();
        for (identity, entry) in drained {
            entry.cancel.cancel();
            if let Err(err) = entry.task.await {
                warn!(%identity, ?err, "watch task did not exit cleanly");
            }
        }
    }
}

/// Releases one subscription when dropped.
#[derive(Debug)]
pub struct WatchHandle<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    registry: Weak<RegistryInner<V>>,
    identity: QueryIdentity,
    generation: u64,
}

impl<V> Drop for WatchHandle<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            WatchRegistry::release(&inner, &self.identity, self.generation);
        }
    }
}

/// Stream of distinct values for one watch target.
///
/// A subscriber that falls more than the registry's buffer behind skips the
/// oldest values and continues with newer ones; it never holds up the loop
/// or other subscribers. Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct WatchStream<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    initial: Option<V>,
    inner: BroadcastStream<V>,
    status: watch::Receiver<WatchStatus>,
    handle: WatchHandle<V>,
}

// fields are never pinned
impl<V> Unpin for WatchStream<V> where V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {}

impl<V> WatchStream<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    /// Next value, or `None` once the watch has been shut down.
    pub async fn recv(&mut self) -> Option<V> {
        self.next().await
    }

    pub fn identity(&self) -> &QueryIdentity {
        &self.handle.identity
    }

    /// Current liveness of the underlying loop.
    pub fn status(&self) -> WatchStatus {
        *self.status.borrow()
    }

    /// Skip values until one satisfies `pred`.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&V) -> bool) -> CoordinationResult<V> {
        while let Some(value) = self.recv().await {
            if pred(&value) {
                return Ok(value);
            }
        }
        Err(CoordinationError::Closed)
    }

    /// Wait until the loop's status satisfies `pred`.
    pub async fn wait_for_status(&mut self, pred: impl FnMut(&WatchStatus) -> bool) -> CoordinationResult<WatchStatus> {
        self.status
            .wait_for(pred)
            .await
            .map(|status| *status)
            .map_err(|_| CoordinationError::Closed)
    }

    /// Explicitly end this subscription. Same as dropping the stream.
    pub fn unsubscribe(self) {}
}

impl<V> Stream for WatchStream<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    type Item = V;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<V>> {
        let this = self.get_mut();
        if let Some(value) = this.initial.take() {
            return Poll::Ready(Some(value));
        }
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => return Poll::Ready(Some(value)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(identity = %this.handle.identity, skipped, "subscriber lagged, skipping oldest values");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
