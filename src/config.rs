//! Configuration for consumers and the `notify-tail` binary
//!
//! [`ConsumerConfig`] is the transport configuration object every consumer is
//! created with. [`NotifierConfig`] is the TOML file format read by the binary.

use crate::tls::TlsSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Transport default for `max_attempts`
pub const DEFAULT_MAX_ATTEMPTS: u16 = 5;

/// Transport configuration for a consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Delivery attempts before a message is given up (0 = unlimited)
    pub max_attempts: u16,
    /// Require transport security on node connections
    pub tls_v1: bool,
    /// Transport security settings, present when `tls_v1` is set
    pub tls_config: Option<TlsSettings>,
    /// Base delay before redelivering a failed message
    pub requeue_delay: Duration,
    /// Upper bound for the redelivery backoff
    pub max_requeue_delay: Duration,
    /// Concurrent handler invocations per consumer
    pub max_in_flight: usize,
    /// Unacknowledged messages a node may hand this consumer at once,
    /// including those waiting out a requeue delay
    pub max_unacked: usize,
    /// How often lookup services are re-queried for node membership
    pub lookup_poll_interval: Duration,
    /// Time to wait for a node to acknowledge the connection
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tls_v1: false,
            tls_config: None,
            requeue_delay: Duration::from_secs(1),
            max_requeue_delay: Duration::from_secs(60),
            max_in_flight: 1,
            max_unacked: 64,
            lookup_poll_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl ConsumerConfig {
    /// Apply a caller supplied attempt limit; `None` and `Some(0)` keep the default
    pub fn with_max_attempts(mut self, max_attempts: Option<u16>) -> Self {
        if let Some(n) = max_attempts.filter(|n| *n > 0) {
            self.max_attempts = n;
        }
        self
    }

    /// Require transport security using the given settings
    pub fn with_tls(mut self, settings: TlsSettings) -> Self {
        self.tls_v1 = true;
        self.tls_config = Some(settings);
        self
    }
}

/// `notify-tail` configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifierConfig {
    pub subscription: SubscriptionSection,
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSection {
    pub topic: String,
    pub channel: String,
    pub max_attempts: Option<u16>,
}

/// Exactly one of the two fields must be set
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    /// Lookup service addresses (lookup-based discovery)
    #[serde(default)]
    pub lookup_addresses: Vec<String>,
    /// Single node `host:port` (direct connection)
    pub node_address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
}

/// Optional tuning, in milliseconds where it is a duration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSection {
    pub requeue_delay_ms: Option<u64>,
    pub max_requeue_delay_ms: Option<u64>,
    pub max_in_flight: Option<usize>,
    pub max_unacked: Option<usize>,
    pub lookup_poll_interval_ms: Option<u64>,
    pub dial_timeout_ms: Option<u64>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NotifierConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: NotifierConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription.topic.is_empty() || self.subscription.channel.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "subscription.topic and subscription.channel must be non-empty".to_string(),
            ));
        }

        let has_lookup = !self.discovery.lookup_addresses.is_empty();
        let has_node = self.discovery.node_address.is_some();
        if has_lookup == has_node {
            return Err(ConfigError::InvalidConfig(
                "set exactly one of discovery.lookup_addresses or discovery.node_address"
                    .to_string(),
            ));
        }

        if self.tls.enabled && (self.tls.cert_path.is_empty() != self.tls.key_path.is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "tls.cert_path and tls.key_path must be given together".to_string(),
            ));
        }

        Ok(())
    }

    /// Transport configuration derived from the `[consumer]` section
    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config =
            ConsumerConfig::default().with_max_attempts(self.subscription.max_attempts);
        let tuning = &self.consumer;
        if let Some(ms) = tuning.requeue_delay_ms {
            config.requeue_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = tuning.max_requeue_delay_ms {
            config.max_requeue_delay = Duration::from_millis(ms);
        }
        if let Some(n) = tuning.max_in_flight.filter(|n| *n > 0) {
            config.max_in_flight = n;
        }
        if let Some(n) = tuning.max_unacked.filter(|n| *n > 0) {
            config.max_unacked = n;
        }
        if let Some(ms) = tuning.lookup_poll_interval_ms {
            config.lookup_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = tuning.dial_timeout_ms {
            config.dial_timeout = Duration::from_millis(ms);
        }
        config
    }
}
