//! Typed models for watch targets, versioned results, and the subset of the
//! Consul HTTP API payloads the watch engine consumes.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// A coordination document: `None` when the key does not exist.
pub type Document = Option<String>;

/// Ids of the healthy instances of a service.
pub type Members = BTreeSet<String>;

// ---------------------------------------------------------------------------
// Query identity
// ---------------------------------------------------------------------------

/// Kind of query issued against a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Instances whose checks are all passing.
    Health,
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKind::Health => write!(f, "health"),
        }
    }
}

/// Uniquely identifies one watch target. Compared and hashed by value, so two
/// subscribers asking for the same key share one watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryIdentity {
    /// A KV key path, without leading slash.
    Key(String),
    /// A query about a named service.
    Service { name: String, kind: QueryKind },
}

impl QueryIdentity {
    pub fn key(path: impl Into<String>) -> Self {
        QueryIdentity::Key(path.into())
    }

    pub fn health(service: impl Into<String>) -> Self {
        QueryIdentity::Service {
            name: service.into(),
            kind: QueryKind::Health,
        }
    }
}

impl std::fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryIdentity::Key(path) => write!(f, "kv:{path}"),
            QueryIdentity::Service { name, kind } => write!(f, "{kind}:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Versioned results
// ---------------------------------------------------------------------------

/// A value together with the Consul modify index it was read at.
///
/// An index of `0` means "no history" and is never sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue<V> {
    pub value: V,
    pub index: u64,
}

impl<V> VersionedValue<V> {
    pub fn new(value: V, index: u64) -> Self {
        Self { value, index }
    }
}

/// Result of a single blocking query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome<V> {
    /// The agent answered, either because the index moved or the wait elapsed.
    Response(VersionedValue<V>),
    /// No answer within the long-poll bound. Treated as "nothing changed".
    NoResponse,
}

// ---------------------------------------------------------------------------
// Consul payloads
// ---------------------------------------------------------------------------

/// One entry of `GET /v1/kv/<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    /// base64 encoded, `null` for keys created without a value
    pub value: Option<String>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl KvPair {
    /// Decode the base64 value into a UTF-8 document.
    pub fn decode_value(&self) -> CoordinationResult<Document> {
        let Some(encoded) = self.value.as_deref() else {
            return Ok(Some(String::new()));
        };
        let bytes = STANDARD.decode(encoded).map_err(|e| {
            CoordinationError::Codec(format!("invalid base64 value for key '{}': {e}", self.key))
        })?;
        String::from_utf8(bytes).map(Some).map_err(|e| {
            CoordinationError::Codec(format!("value for key '{}' is not UTF-8: {e}", self.key))
        })
    }
}

/// One entry of `GET /v1/health/service/<service>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "CheckID", default)]
    pub check_id: String,
    pub status: String,
}

impl ServiceEntry {
    /// True when every check attached to the instance is passing.
    pub fn is_passing(&self) -> bool {
        self.checks.iter().all(|c| c.status == "passing")
    }
}

/// Decode a KV response body. Consul returns a single-element array for a
/// plain key read.
pub fn decode_kv(body: &[u8]) -> CoordinationResult<Document> {
    let pairs: Vec<KvPair> = serde_json::from_slice(body)
        .map_err(|e| CoordinationError::Codec(format!("invalid KV response: {e}")))?;
    match pairs.first() {
        Some(pair) => pair.decode_value(),
        None => Ok(None),
    }
}

/// Decode a health response body into the set of passing instance ids.
pub fn decode_health(body: &[u8]) -> CoordinationResult<Members> {
    let entries: Vec<ServiceEntry> = serde_json::from_slice(body)
        .map_err(|e| CoordinationError::Codec(format!("invalid health response: {e}")))?;
    Ok(entries
        .into_iter()
        .filter(ServiceEntry::is_passing)
        .map(|e| e.service.id)
        .collect())
}
