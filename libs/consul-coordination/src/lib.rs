//! # consul-coordination
//!
//! Watch engine for connector groups coordinated through Consul.
//!
//! This library provides:
//! - **Consul client** issuing blocking (long-poll) KV and health queries,
//!   plus one-shot KV reads and writes.
//! - **Change watcher** turning index-versioned blocking queries into a
//!   sequence of distinct values, retrying transport failures with capped
//!   exponential backoff.
//! - **Debouncer** collapsing bursts of membership changes into one settled
//!   snapshot.
//! - **Watch registry** sharing one loop per watched target between any
//!   number of subscribers, with teardown at zero subscribers.
//! - **Coordination context** exposing the config, control and service
//!   health streams of one connector group.
//!
//! ## Design Principles
//!
//! - Subscribers only ever see valid values; backend instability shows up as
//!   a liveness status, never as a stream error.
//! - No hard-coded key strings in runtime paths.
//! - A slow subscriber never holds up the watch loop.

pub mod client;
pub mod context;
pub mod debounce;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod source;
pub mod watcher;

#[cfg(test)]
mod test_utils;

// Re-export key types for convenient access
pub use client::{ConsulClient, ConsulClientBuilder};
pub use context::CoordinationContext;
pub use debounce::{Debounced, debounce};
pub use error::{CoordinationError, CoordinationResult};
pub use keys::{DocumentKeys, DocumentKind};
pub use models::{Document, Members, QueryIdentity, QueryKind, QueryOutcome, VersionedValue};
pub use registry::{WatchHandle, WatchRegistry, WatchStream};
pub use source::{BlockingQuerySource, HealthSource, KvSource};
pub use watcher::{ChangeWatcher, RetryPolicy, WatchStatus};
