//! Lookup service client
//!
//! A lookup service maps a topic to the data nodes currently carrying it:
//! `GET {address}/lookup?topic={topic}` answers with the producer list. Both the
//! bare response and the older `{"data": ...}` envelope are accepted.

use super::ConsumerError;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// A node advertised by the lookup service
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl Producer {
    /// `host:port` address of the node
    pub fn address(&self) -> String {
        if self.broadcast_address.contains(':') {
            format!("[{}]:{}", self.broadcast_address, self.tcp_port)
        } else {
            format!("{}:{}", self.broadcast_address, self.tcp_port)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LookupResponse {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupEnvelope {
    Legacy { data: LookupResponse },
    Current(LookupResponse),
}

impl LookupEnvelope {
    fn into_response(self) -> LookupResponse {
        match self {
            LookupEnvelope::Legacy { data } => data,
            LookupEnvelope::Current(response) => response,
        }
    }
}

/// Parse a lookup response body
pub fn parse_lookup_response(body: &[u8]) -> Result<LookupResponse, serde_json::Error> {
    serde_json::from_slice::<LookupEnvelope>(body).map(LookupEnvelope::into_response)
}

/// Build the lookup URL for a topic; bare `host:port` addresses get `http://`
pub fn lookup_url(address: &str, topic: &str) -> Result<Url, ConsumerError> {
    let base = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let mut url = Url::parse(&base).map_err(|e| ConsumerError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    url.set_path("/lookup");
    url.query_pairs_mut().clear().append_pair("topic", topic);
    Ok(url)
}

/// Queries lookup services for the nodes serving one topic
#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    topic: String,
}

impl LookupClient {
    pub fn new(topic: &str, timeout: Duration) -> Result<Self, ConsumerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConsumerError::Lookup(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            http,
            topic: topic.to_string(),
        })
    }

    /// Node addresses known to one lookup service
    pub async fn query(&self, address: &str) -> Result<Vec<String>, ConsumerError> {
        let url = lookup_url(address, &self.topic)?;
        let response = self
            .http
            .get(url)
            .header("Accept", "application/vnd.nsq; version=1.0")
            .send()
            .await
            .map_err(|e| ConsumerError::Lookup(format!("{address}: {e}")))?;

        // Topic not yet registered anywhere
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(lookup = address, topic = %self.topic, "Topic unknown to lookup service");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(ConsumerError::Lookup(format!(
                "{address}: unexpected status {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ConsumerError::Lookup(format!("{address}: {e}")))?;
        let parsed = parse_lookup_response(&body)
            .map_err(|e| ConsumerError::Lookup(format!("{address}: malformed response: {e}")))?;

        Ok(parsed.producers.iter().map(Producer::address).collect())
    }

    /// Union of the nodes known to all lookup services
    ///
    /// Fails only when no lookup service answered.
    pub async fn query_all(&self, addresses: &[String]) -> Result<BTreeSet<String>, ConsumerError> {
        let mut nodes = BTreeSet::new();
        let mut failures = Vec::new();

        for address in addresses {
            match self.query(address).await {
                Ok(found) => nodes.extend(found),
                Err(e) => {
                    warn!(lookup = %address, error = %e, "Lookup query failed");
                    failures.push(e.to_string());
                }
            }
        }

        if !addresses.is_empty() && failures.len() == addresses.len() {
            return Err(ConsumerError::Lookup(failures.join("; ")));
        }
        Ok(nodes)
    }
}
