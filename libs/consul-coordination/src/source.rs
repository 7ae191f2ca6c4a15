//! Blocking query sources: one logical query against the coordination backend.
//!
//! A source blocks for at most the backend's long-poll bound. Returning the
//! same index means nothing changed. Only genuine transport or backend
//! failures are errors; a wait that elapses never is.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::client::ConsulClient;
use crate::error::CoordinationResult;
use crate::models::{Document, Members, QueryIdentity, QueryOutcome};

/// One logical blocking query.
#[async_trait]
pub trait BlockingQuerySource: Send + Sync + 'static {
    /// Value produced by the query.
    type Value: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Identity of the watched target, used for logging.
    fn identity(&self) -> QueryIdentity;

    /// Block until the value changes past `index` or the wait elapses.
    /// `index == 0` asks for the current value without blocking.
    async fn query(&self, index: u64) -> CoordinationResult<QueryOutcome<Self::Value>>;
}

/// Watches a single KV key.
#[derive(Debug, Clone)]
pub struct KvSource {
    client: ConsulClient,
    key: String,
}

impl KvSource {
    pub fn new(client: ConsulClient, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
        }
    }
}

#[async_trait]
impl BlockingQuerySource for KvSource {
    type Value = Document;

    fn identity(&self) -> QueryIdentity {
        QueryIdentity::key(self.key.clone())
    }

    async fn query(&self, index: u64) -> CoordinationResult<QueryOutcome<Document>> {
        self.client.kv_blocking(&self.key, index).await
    }
}

/// Watches the set of passing instances of a service.
#[derive(Debug, Clone)]
pub struct HealthSource {
    client: ConsulClient,
    service: String,
}

impl HealthSource {
    pub fn new(client: ConsulClient, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }
}

#[async_trait]
impl BlockingQuerySource for HealthSource {
    type Value = Members;

    fn identity(&self) -> QueryIdentity {
        QueryIdentity::health(self.service.clone())
    }

    async fn query(&self, index: u64) -> CoordinationResult<QueryOutcome<Members>> {
        self.client.health_blocking(&self.service, index).await
    }
}
