//! Coordination context for one connector group.
//!
//! Owns the shared Consul client, the group's document keys and the watch
//! registries, and hands out named change streams built on top of them.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use config::{CoordinationConfig, WatchConfig};

use crate::{
    client::{ConsulClient, ConsulClientBuilder},
    debounce::{Debounced, debounce},
    error::{CoordinationError, CoordinationResult},
    keys::{DocumentKeys, DocumentKind},
    models::{Document, Members, QueryIdentity},
    registry::{WatchRegistry, WatchStream},
    source::{HealthSource, KvSource},
    watcher::RetryPolicy,
};

/// Entry point for watching a connector group's coordination state.
#[derive(Debug)]
pub struct CoordinationContext {
    consul: ConsulClient,
    builder: ConsulClientBuilder,
    keys: DocumentKeys,
    service_name: String,
    service_id: String,
    watch: WatchConfig,
    shutdown: CancellationToken,
    documents: WatchRegistry<Document>,
    members: WatchRegistry<Members>,
}

impl CoordinationContext {
    /// Context for `service_name` under the default key prefix.
    ///
    /// `service_id` identifies this instance and defaults to the service
    /// name. Invalid client settings or names fail here and are never
    /// retried.
    pub fn new(
        builder: ConsulClientBuilder,
        service_name: impl Into<String>,
        service_id: Option<String>,
    ) -> CoordinationResult<Self> {
        let service_name = service_name.into();
        let keys = DocumentKeys::with_default_prefix(&service_name)?;
        Self::with_options(builder, keys, service_name, service_id, WatchConfig::default())
    }

    pub fn with_options(
        builder: ConsulClientBuilder,
        keys: DocumentKeys,
        service_name: String,
        service_id: Option<String>,
        watch: WatchConfig,
    ) -> CoordinationResult<Self> {
        let consul = builder.build()?;
        let service_id = match service_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CoordinationError::Config("service id is empty".into()));
            }
            Some(id) => id,
            None => service_name.clone(),
        };

        let shutdown = CancellationToken::new();
        let retry = RetryPolicy::from(&watch);
        info!(
            consul = %consul.base_url(),
            %service_name,
            %service_id,
            root = keys.root(),
            "coordination context created"
        );

        Ok(Self {
            documents: WatchRegistry::with_shutdown(retry, watch.subscriber_buffer, shutdown.clone()),
            members: WatchRegistry::with_shutdown(retry, watch.subscriber_buffer, shutdown.clone()),
            consul,
            builder,
            keys,
            service_name,
            service_id,
            watch,
            shutdown,
        })
    }

    pub fn from_config(config: &CoordinationConfig) -> CoordinationResult<Self> {
        let keys = DocumentKeys::new(&config.key_prefix, &config.service_name)?;
        Self::with_options(
            ConsulClientBuilder::from_config(&config.consul),
            keys,
            config.service_name.clone(),
            config.service_id.clone(),
            config.watch,
        )
    }

    /// One-shot read of the config document. Surfaces an unreachable agent
    /// or a rejected token before any watch is started.
    pub async fn verify(&self) -> CoordinationResult<()> {
        let current = self.consul.kv_get(self.keys.config()).await?;
        debug!(index = current.index, present = current.value.is_some(), "consul reachable");
        Ok(())
    }

    /// Changes to `<prefix>/<service>/config`.
    pub fn watch_config(&self) -> CoordinationResult<WatchStream<Document>> {
        self.watch_document(DocumentKind::Config)
    }

    /// Changes to `<prefix>/<service>/control`.
    pub fn watch_control(&self) -> CoordinationResult<WatchStream<Document>> {
        self.watch_document(DocumentKind::Control)
    }

    pub fn watch_document(&self, kind: DocumentKind) -> CoordinationResult<WatchStream<Document>> {
        self.watch_key(self.keys.resolve(kind))
    }

    /// Changes to an arbitrary KV key. Shares the loop with any other
    /// subscriber of the same key.
    pub fn watch_key(&self, key: &str) -> CoordinationResult<WatchStream<Document>> {
        let client = self.consul.clone();
        let key = key.to_owned();
        self.documents
            .watch(QueryIdentity::key(key.clone()), move || KvSource::new(client, key))
    }

    /// Current value of a document plus its later changes.
    pub async fn subscribe_document(
        &self,
        kind: DocumentKind,
    ) -> CoordinationResult<(Document, WatchStream<Document>)> {
        let client = self.consul.clone();
        let key = self.keys.resolve(kind).to_owned();
        self.documents
            .subscribe(QueryIdentity::key(key.clone()), move || KvSource::new(client, key))
            .await
    }

    /// Passing instances of this service, emitted only after membership has
    /// been stable for `quiet_period`.
    pub fn watch_service_health(
        &self,
        quiet_period: Duration,
    ) -> CoordinationResult<Debounced<WatchStream<Members>>> {
        self.watch_health_of(&self.service_name, quiet_period)
    }

    /// Like [`watch_service_health`](Self::watch_service_health) for any
    /// service registered with the agent.
    pub fn watch_health_of(
        &self,
        service: &str,
        quiet_period: Duration,
    ) -> CoordinationResult<Debounced<WatchStream<Members>>> {
        let client = self.consul.clone();
        let name = service.to_owned();
        let stream = self
            .members
            .watch(QueryIdentity::health(service), move || HealthSource::new(client, name))?;
        Ok(debounce(stream, quiet_period))
    }

    /// Quiet period configured for health streams.
    pub fn health_quiet_period(&self) -> Duration {
        self.watch.health_quiet_period
    }

    pub fn consul(&self) -> &ConsulClient {
        &self.consul
    }

    /// Settings used for the shared client, for building dedicated ones.
    pub fn consul_builder(&self) -> &ConsulClientBuilder {
        &self.builder
    }

    pub fn keys(&self) -> &DocumentKeys {
        &self.keys
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn documents(&self) -> &WatchRegistry<Document> {
        &self.documents
    }

    pub fn members(&self) -> &WatchRegistry<Members> {
        &self.members
    }

    /// Token cancelled when the context shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every watch. Open streams end; new subscriptions fail with
    /// [`CoordinationError::Closed`].
    pub async fn shutdown(&self) {
        info!(service_name = %self.service_name, "shutting down coordination context");
        self.shutdown.cancel();
        self.documents.shutdown().await;
        self.members.shutdown().await;
    }
}

impl Drop for CoordinationContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // nothing listens here, queries fail fast and back off
    const DEAD_AGENT: &str = "http://127.0.0.1:1";

    fn context() -> CoordinationContext {
        CoordinationContext::new(ConsulClientBuilder::new(DEAD_AGENT), "orders", None).unwrap()
    }

    #[test]
    fn test_invalid_address_fails_construction() {
        let err = CoordinationContext::new(ConsulClientBuilder::new("ftp://consul"), "orders", None)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }

    #[test]
    fn test_invalid_service_name_fails_construction() {
        let err = CoordinationContext::new(ConsulClientBuilder::new(DEAD_AGENT), "a/b", None)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));

        let err = CoordinationContext::new(
            ConsulClientBuilder::new(DEAD_AGENT),
            "orders",
            Some(" ".into()),
        )
        .unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }

    #[test]
    fn test_service_id_defaults_to_name() {
        let ctx = context();
        assert_eq!(ctx.service_name(), "orders");
        assert_eq!(ctx.service_id(), "orders");
        assert_eq!(ctx.keys().config(), "couchbase/cbes/orders/config");
        assert_eq!(ctx.keys().control(), "couchbase/cbes/orders/control");

        let ctx = CoordinationContext::new(
            ConsulClientBuilder::new(DEAD_AGENT),
            "orders",
            Some("orders-2".into()),
        )
        .unwrap();
        assert_eq!(ctx.service_id(), "orders-2");
        assert_eq!(ctx.consul_builder().address(), DEAD_AGENT);
    }

    #[test]
    fn test_from_config() {
        let config = CoordinationConfig::new(
            r#"
consul:
  address: "127.0.0.1:1"
service:
  name: payments
  id: payments-1
  key_prefix: connectors
watch:
  health_quiet_period: 250ms
"#,
        )
        .unwrap();
        let ctx = CoordinationContext::from_config(&config).unwrap();
        assert_eq!(ctx.service_id(), "payments-1");
        assert_eq!(ctx.keys().control(), "connectors/payments/control");
        assert_eq!(ctx.health_quiet_period(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_streams_share_loops_per_target() {
        let ctx = context();
        let _a = ctx.watch_config().unwrap();
        let _b = ctx.watch_config().unwrap();
        let _c = ctx.watch_control().unwrap();
        let _d = ctx.watch_service_health(Duration::from_millis(50)).unwrap();
        let _e = ctx.watch_service_health(Duration::from_millis(50)).unwrap();

        assert_eq!(ctx.documents().watchers_started(), 2);
        assert_eq!(ctx.members().watchers_started(), 1);
        assert_eq!(
            ctx.documents()
                .subscriber_count(&QueryIdentity::key("couchbase/cbes/orders/config")),
            2
        );
        assert_eq!(ctx.members().subscriber_count(&QueryIdentity::health("orders")), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_context() {
        let ctx = context();
        let mut config = ctx.watch_config().unwrap();
        ctx.shutdown().await;

        assert!(ctx.shutdown_token().is_cancelled());
        assert_eq!(ctx.documents().running_watchers(), 0);
        assert_eq!(config.recv().await, None);
        assert!(matches!(ctx.watch_control(), Err(CoordinationError::Closed)));
    }
}
