//! Consumer transport layer
//!
//! [`Consumer`] is the seam between the [`NotifyClient`](crate::NotifyClient)
//! facade and the queue transport that actually talks to data nodes. The
//! production implementation is [`mqtt::MqttConsumer`]; tests use
//! [`MockConsumer`](crate::testing::MockConsumer).

use crate::config::ConsumerConfig;
use crate::message::Handler;
use std::sync::Arc;
use thiserror::Error;

pub mod dispatch;
pub mod lookup;
pub mod mqtt;

/// Errors raised by consumer transports
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("consumer has been stopped")]
    Stopped,
}

/// A subscription to one topic/channel pair
///
/// Implementations own node connections and handler dispatch. Requeue and
/// retry behaviour on handler failure is theirs, bounded by
/// [`ConsumerConfig::max_attempts`].
#[async_trait::async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Create an unconnected consumer
    fn create(topic: &str, channel: &str, config: ConsumerConfig) -> Result<Self, ConsumerError>
    where
        Self: Sized;

    fn config(&self) -> &ConsumerConfig;

    /// Register a message handler; multiple handlers share the load
    fn add_handler(&self, handler: Arc<dyn Handler>);

    /// Discover nodes through lookup services and connect to all of them
    async fn connect_to_lookups(&self, addresses: &[String]) -> Result<(), ConsumerError>;

    /// Connect to a single node, bypassing discovery
    async fn connect_to_node(&self, address: &str) -> Result<(), ConsumerError>;

    /// Full shutdown: every node connection and any discovery polling
    async fn stop(&self);

    /// Disconnect one node previously connected with `connect_to_node`
    async fn disconnect_from_node(&self, address: &str) -> Result<(), ConsumerError>;
}

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Topic names are 1-64 characters of `[.a-zA-Z0-9_-]`
pub fn validate_topic_name(topic: &str) -> Result<(), ConsumerError> {
    if is_valid_name(topic) {
        Ok(())
    } else {
        Err(ConsumerError::InvalidName {
            kind: "topic",
            name: topic.to_string(),
        })
    }
}

/// Channel names follow topic rules and may end in `#ephemeral`
pub fn validate_channel_name(channel: &str) -> Result<(), ConsumerError> {
    let base = channel.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(channel);
    if is_valid_name(base) && channel.len() <= MAX_NAME_LEN {
        Ok(())
    } else {
        Err(ConsumerError::InvalidName {
            kind: "channel",
            name: channel.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("notifications").is_ok());
        assert!(validate_topic_name("user.events_v2-eu").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name("slash/topic").is_err());
        assert!(validate_topic_name(&"t".repeat(65)).is_err());
        assert!(validate_topic_name("t#ephemeral").is_err());
    }

    #[test]
    fn test_channel_names() {
        assert!(validate_channel_name("mailer").is_ok());
        assert!(validate_channel_name("tail#ephemeral").is_ok());
        assert!(validate_channel_name("#ephemeral").is_err());
        assert!(validate_channel_name("a#b").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_charset_accepted(name in "[.a-zA-Z0-9_-]{1,64}") {
            prop_assert!(validate_topic_name(&name).is_ok());
            prop_assert!(validate_channel_name(&name).is_ok());
        }

        #[test]
        fn prop_foreign_chars_rejected(prefix in "[a-z]{0,10}", bad in "[ /#$+*]", suffix in "[a-z]{0,10}") {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(validate_topic_name(&name).is_err());
        }
    }
}
