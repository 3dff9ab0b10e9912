//! Pure connection setup for MQTT data nodes
//!
//! Address parsing, subscription filter construction and option building.
//! Nothing here touches the network.

use crate::config::ConsumerConfig;
use crate::tls::TlsSettings;
use crate::transport::ConsumerError;
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport};
use url::Url;
use uuid::Uuid;

const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Parsed data node address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    /// `mqtts://` was requested explicitly
    pub tls: bool,
}

/// Accepts `host:port`, `mqtt://host[:port]` and `mqtts://host[:port]`
pub fn parse_node_address(address: &str) -> Result<NodeAddress, ConsumerError> {
    let invalid = |reason: &str| ConsumerError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (url, explicit_scheme) = if address.contains("://") {
        (Url::parse(address), true)
    } else {
        (Url::parse(&format!("mqtt://{address}")), false)
    };
    let url = url.map_err(|e| invalid(&e.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => return Err(invalid(&format!("unsupported scheme {other}"))),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let port = match url.port() {
        Some(port) => port,
        None if explicit_scheme => {
            if tls {
                TLS_PORT
            } else {
                PLAIN_PORT
            }
        }
        None => return Err(invalid("missing port")),
    };

    Ok(NodeAddress { host, port, tls })
}

/// Shared subscription filter: every consumer on a channel joins one reader group
pub fn subscription_filter(topic: &str, channel: &str) -> String {
    let group = channel.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(channel);
    format!("$share/{group}/{topic}")
}

/// Build options for one node connection
pub fn configure_mqtt_options(
    node: &NodeAddress,
    channel: &str,
    config: &ConsumerConfig,
) -> MqttOptions {
    let group = channel.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(channel);
    let client_id = format!("notifier-{group}-{}", Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, node.host.clone(), node.port);

    options.set_keep_alive(config.keep_alive);
    // Acks are sent once a handler finishes or the message is given up
    options.set_manual_acks(true);
    options.set_clean_start(true);
    // The node stops sending once this many messages are awaiting our ack
    options.set_receive_maximum(Some(
        u16::try_from(config.max_unacked.max(1)).unwrap_or(u16::MAX),
    ));

    if config.tls_v1 || node.tls {
        let settings = config
            .tls_config
            .clone()
            .unwrap_or_else(TlsSettings::anonymous);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            settings.client_config(),
        )));
    }

    options
}
