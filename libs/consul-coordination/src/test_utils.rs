//! Scripted in-memory source for driving watchers from tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{QueryIdentity, QueryOutcome, VersionedValue};
use crate::source::BlockingQuerySource;

type Step<V> = CoordinationResult<QueryOutcome<V>>;

struct Shared<V> {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Step<V>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    indexes: Mutex<Vec<u64>>,
}

/// Answers each query with the next scripted step; with nothing scripted the
/// query blocks, like a long poll with no change.
pub(crate) struct ScriptedSource<V> {
    identity: QueryIdentity,
    shared: Arc<Shared<V>>,
}

impl<V> Clone for ScriptedSource<V> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Test-side control of a [`ScriptedSource`].
pub(crate) struct Script<V> {
    tx: mpsc::UnboundedSender<Step<V>>,
    shared: Arc<Shared<V>>,
}

impl<V: Send + 'static> ScriptedSource<V> {
    pub(crate) fn new(identity: QueryIdentity) -> (Self, Script<V>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            rx: tokio::sync::Mutex::new(rx),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            indexes: Mutex::new(Vec::new()),
        });
        (
            Self {
                identity,
                shared: Arc::clone(&shared),
            },
            Script { tx, shared },
        )
    }
}

impl<V> Script<V> {
    pub(crate) fn respond(&self, value: V, index: u64) {
        let _ = self
            .tx
            .send(Ok(QueryOutcome::Response(VersionedValue::new(value, index))));
    }

    pub(crate) fn no_response(&self) {
        let _ = self.tx.send(Ok(QueryOutcome::NoResponse));
    }

    pub(crate) fn fail(&self) {
        self.fail_with(CoordinationError::Transport("connection refused".into()));
    }

    pub(crate) fn fail_with(&self, err: CoordinationError) {
        let _ = self.tx.send(Err(err));
    }

    pub(crate) fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Index argument of every query issued so far.
    pub(crate) fn indexes(&self) -> Vec<u64> {
        self.shared.indexes.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<V> BlockingQuerySource for ScriptedSource<V>
where
    V: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    type Value = V;

    fn identity(&self) -> QueryIdentity {
        self.identity.clone()
    }

    async fn query(&self, index: u64) -> CoordinationResult<QueryOutcome<V>> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        self.shared.indexes.lock().push(index);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(&self.shared.in_flight);

        let next = self.shared.rx.lock().await.recv().await;
        match next {
            Some(step) => step,
            None => futures::future::pending().await,
        }
    }
}
