//! Well-known coordination key paths for a connector group.
//!
//! Every document of a group lives under `<prefix>/<service_name>/`. The
//! resolver is a pure translator from logical document to KV path; runtime
//! code never formats key strings itself.

use crate::error::{CoordinationError, CoordinationResult};

/// Logical coordination documents of a connector group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Connector configuration, watched for live reconfiguration.
    Config,
    /// Control signals (pause/resume/stop) issued by operators.
    Control,
    /// Session-locked key held by the elected leader.
    Leader,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKind::Config => write!(f, "config"),
            DocumentKind::Control => write!(f, "control"),
            DocumentKind::Leader => write!(f, "leader"),
        }
    }
}

/// All logical documents, for iteration.
pub const ALL_DOCUMENTS: &[DocumentKind] = &[
    DocumentKind::Config,
    DocumentKind::Control,
    DocumentKind::Leader,
];

/// Key paths for one service, validated at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentKeys {
    root: String,
    config: String,
    control: String,
    leader: String,
    rpc_endpoints: String,
}

impl DocumentKeys {
    /// Create the key set for `service_name` under `prefix`.
    ///
    /// Leading/trailing slashes on the prefix are ignored. Returns an error if
    /// the prefix has empty segments or the service name is empty or contains
    /// a slash.
    pub fn new(prefix: &str, service_name: &str) -> CoordinationResult<Self> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() || prefix.split('/').any(|seg| seg.trim().is_empty()) {
            return Err(CoordinationError::Config(format!(
                "key prefix '{prefix}' contains an empty segment"
            )));
        }
        if service_name.trim().is_empty() || service_name.contains('/') {
            return Err(CoordinationError::Config(format!(
                "service name '{service_name}' must be non-empty and contain no '/'"
            )));
        }

        let root = format!("{prefix}/{service_name}");
        Ok(Self {
            config: format!("{root}/config"),
            control: format!("{root}/control"),
            leader: format!("{root}/leader"),
            rpc_endpoints: format!("{root}/rpc/"),
            root,
        })
    }

    /// Key set using [`config::wire::DEFAULT_KEY_PREFIX`].
    pub fn with_default_prefix(service_name: &str) -> CoordinationResult<Self> {
        Self::new(config::wire::DEFAULT_KEY_PREFIX, service_name)
    }

    /// Resolve a logical document to its KV path.
    pub fn resolve(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Config => &self.config,
            DocumentKind::Control => &self.control,
            DocumentKind::Leader => &self.leader,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn config(&self) -> &str {
        &self.config
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn leader(&self) -> &str {
        &self.leader
    }

    /// Prefix (with trailing slash) under which instances publish their RPC endpoints.
    pub fn rpc_endpoints(&self) -> &str {
        &self.rpc_endpoints
    }

    /// RPC endpoint key for one instance.
    pub fn rpc_endpoint(&self, service_id: &str) -> String {
        format!("{}{service_id}", self.rpc_endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = DocumentKeys::with_default_prefix("group-a").unwrap();
        assert_eq!(keys.root(), "couchbase/cbes/group-a");
        assert_eq!(keys.config(), "couchbase/cbes/group-a/config");
        assert_eq!(keys.control(), "couchbase/cbes/group-a/control");
        assert_eq!(keys.leader(), "couchbase/cbes/group-a/leader");
        assert_eq!(keys.rpc_endpoints(), "couchbase/cbes/group-a/rpc/");
        assert_eq!(
            keys.rpc_endpoint("node-1"),
            "couchbase/cbes/group-a/rpc/node-1"
        );
    }

    #[test]
    fn test_resolve_matches_accessors() {
        let keys = DocumentKeys::new("/svc/", "x").unwrap();
        assert_eq!(keys.resolve(DocumentKind::Config), "svc/x/config");
        for kind in ALL_DOCUMENTS {
            assert!(keys.resolve(*kind).ends_with(&kind.to_string()));
        }
    }

    #[test]
    fn test_invalid_keys() {
        assert!(DocumentKeys::new("", "x").is_err());
        assert!(DocumentKeys::new("a//b", "x").is_err());
        assert!(DocumentKeys::new("a", "").is_err());
        assert!(matches!(
            DocumentKeys::new("a", "x/y").unwrap_err(),
            CoordinationError::Config(_)
        ));
    }
}
