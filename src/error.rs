//! Error types for the notify client facade
//!
//! [`FatalError`] covers construction failures, a consumer that cannot be
//! created or a key pair that cannot be loaded, and is what the panicking
//! constructors abort with. [`NotifyError`] covers runtime
//! conditions such as an unreachable queue server, which callers may retry.

use crate::tls::TlsError;
use crate::transport::ConsumerError;
use thiserror::Error;

/// Recoverable errors returned by [`NotifyClient`](crate::NotifyClient) operations
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("can not connect to queue server: {0}")]
    Connect(#[source] ConsumerError),

    #[error("no queue server addresses given")]
    NoAddresses,

    #[error("client is already connected via {strategy}")]
    AlreadyConnected { strategy: &'static str },

    #[error("client has been closed")]
    Closed,
}

impl NotifyError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Connect(_))
    }
}

/// Unrecoverable construction-time failures
///
/// Returned by the `try_*` constructors; the plain constructors panic with it.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to create consumer for {topic}/{channel}: {source}")]
    ConsumerCreation {
        topic: String,
        channel: String,
        #[source]
        source: ConsumerError,
    },

    #[error("failed to load transport security key pair: {0}")]
    KeyPair(#[from] TlsError),
}

/// Result type for client operations
pub type NotifyResult<T> = Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_carries_cause() {
        let error = NotifyError::Connect(ConsumerError::Connection {
            address: "10.0.0.1:4150".to_string(),
            reason: "connection refused".to_string(),
        });

        let message = error.to_string();
        assert!(message.starts_with("can not connect to queue server"));
        assert!(message.contains("connection refused"));
        assert!(message.contains("10.0.0.1:4150"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_lifecycle_errors_not_retryable() {
        assert!(!NotifyError::Closed.is_retryable());
        assert!(!NotifyError::NoAddresses.is_retryable());
        assert!(!NotifyError::AlreadyConnected { strategy: "direct" }.is_retryable());
    }

    #[test]
    fn test_fatal_error_display() {
        let error = FatalError::ConsumerCreation {
            topic: "bad topic".to_string(),
            channel: "ch".to_string(),
            source: ConsumerError::InvalidName {
                kind: "topic",
                name: "bad topic".to_string(),
            },
        };
        let message = error.to_string();
        assert!(message.contains("bad topic/ch"));
        assert!(message.contains("invalid topic name"));

        let error = FatalError::from(TlsError::MissingPrivateKey("client.key".into()));
        assert!(error.to_string().contains("client.key"));
    }
}
