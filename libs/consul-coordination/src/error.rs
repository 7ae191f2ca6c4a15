//! Error types for Consul coordination operations.
//!
//! Watch loops absorb every variant internally, logging non-retryable ones
//! as permanent; only construction and one-shot KV calls hand these to
//! callers.

use thiserror::Error;

/// Top-level error type for the consul-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Connection refused/reset, or a 5xx from the agent.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete within its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A response body or header could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid client or context configuration. Construction fails with it;
    /// inside a running watch it is logged as permanent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The ACL token was rejected (401/403).
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Unexpected status or protocol violation from the agent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The registry or context has been shut down.
    #[error("watch registry closed")]
    Closed,
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    ///
    /// Auth failures count as transient inside a running watch since tokens
    /// can be re-issued; construction surfaces them directly instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_)
                | CoordinationError::Timeout(_)
                | CoordinationError::Codec(_)
                | CoordinationError::Protocol(_)
                | CoordinationError::Auth(_)
        )
    }
}

impl From<reqwest::Error> for CoordinationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoordinationError::Timeout(err.to_string())
        } else if err.is_builder() {
            CoordinationError::Config(err.to_string())
        } else if err.is_decode() {
            CoordinationError::Codec(err.to_string())
        } else {
            CoordinationError::Transport(err.to_string())
        }
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = CoordinationError::Transport("conn reset".into());
        assert!(transport.is_retryable());

        let timeout = CoordinationError::Timeout("deadline exceeded".into());
        assert!(timeout.is_retryable());

        assert!(CoordinationError::Codec("bad json".into()).is_retryable());
        assert!(CoordinationError::Protocol("status 418".into()).is_retryable());
        assert!(CoordinationError::Auth("403".into()).is_retryable());

        assert!(!CoordinationError::Config("missing address".into()).is_retryable());
        assert!(!CoordinationError::Closed.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::Auth("ACL not found".into());
        assert_eq!(format!("{err}"), "authorization failed: ACL not found");
        assert_eq!(CoordinationError::Closed.to_string(), "watch registry closed");
    }
}
