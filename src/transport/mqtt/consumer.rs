//! MQTT-backed consumer
//!
//! Data nodes are MQTT v5 brokers. A topic/channel pair maps to the shared
//! subscription `$share/{channel}/{topic}`, so every consumer on the same
//! channel belongs to one reader group and each message goes to one of them.

use super::connection::{configure_mqtt_options, parse_node_address, subscription_filter};
use super::node::{DeliveryContext, NodeConnection};
use crate::config::ConsumerConfig;
use crate::consumer_span;
use crate::message::Handler;
use crate::transport::dispatch::Dispatcher;
use crate::transport::lookup::LookupClient;
use crate::transport::{validate_channel_name, validate_topic_name, Consumer, ConsumerError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

struct Inner {
    topic: String,
    channel: String,
    context: DeliveryContext,
    nodes: Mutex<HashMap<String, NodeConnection>>,
}

impl Inner {
    async fn open_node(&self, address: &str) -> Result<(), ConsumerError> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(address) {
            return Err(ConsumerError::AlreadyConnected(address.to_string()));
        }

        let node = parse_node_address(address)?;
        let options = configure_mqtt_options(&node, &self.channel, &self.context.config);
        let connection = NodeConnection::open(address, options, self.context.clone()).await?;
        nodes.insert(address.to_string(), connection);
        Ok(())
    }

    async fn close_node(&self, address: &str) -> Result<(), ConsumerError> {
        let connection = self
            .nodes
            .lock()
            .await
            .remove(address)
            .ok_or_else(|| ConsumerError::NotConnected(address.to_string()))?;
        connection.close().await;
        Ok(())
    }

    async fn close_all(&self) {
        let connections: Vec<NodeConnection> =
            self.nodes.lock().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            debug!(node = connection.address(), "Closing node");
            connection.close().await;
        }
    }

    /// Bring connections in line with the latest lookup answer
    ///
    /// `known` holds the nodes this consumer connected through lookup; nodes
    /// connected directly are never touched.
    async fn reconcile(&self, discovered: &BTreeSet<String>, known: &mut BTreeSet<String>) {
        let added: Vec<String> = discovered.difference(known).cloned().collect();
        for address in added {
            match self.open_node(&address).await {
                Ok(()) => {
                    known.insert(address);
                }
                Err(ConsumerError::AlreadyConnected(_)) => {
                    debug!(node = %address, "Discovered node already connected directly");
                }
                Err(e) => warn!(node = %address, error = %e, "Failed to connect discovered node"),
            }
        }

        let vanished: Vec<String> = known.difference(discovered).cloned().collect();
        for address in vanished {
            info!(node = %address, "Node no longer advertised, disconnecting");
            let _ = self.close_node(&address).await;
            known.remove(&address);
        }
    }
}

struct LookupPoller {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Production [`Consumer`] over MQTT brokers
pub struct MqttConsumer {
    inner: Arc<Inner>,
    poller: Mutex<Option<LookupPoller>>,
    stopped: AtomicBool,
}

impl MqttConsumer {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Addresses of the nodes currently connected
    pub async fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.inner.nodes.lock().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn ensure_running(&self) -> Result<(), ConsumerError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(ConsumerError::Stopped)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Consumer for MqttConsumer {
    fn create(topic: &str, channel: &str, config: ConsumerConfig) -> Result<Self, ConsumerError> {
        validate_topic_name(topic)?;
        validate_channel_name(channel)?;

        let context = DeliveryContext::new(
            subscription_filter(topic, channel),
            Arc::new(Dispatcher::new(config.max_attempts)),
            Arc::new(config),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                topic: topic.to_string(),
                channel: channel.to_string(),
                context,
                nodes: Mutex::new(HashMap::new()),
            }),
            poller: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    fn config(&self) -> &ConsumerConfig {
        &self.inner.context.config
    }

    fn add_handler(&self, handler: Arc<dyn Handler>) {
        self.inner.context.dispatcher.add_handler(handler);
    }

    async fn connect_to_lookups(&self, addresses: &[String]) -> Result<(), ConsumerError> {
        self.ensure_running()?;
        let config = &self.inner.context.config;
        let lookup = LookupClient::new(&self.inner.topic, config.dial_timeout)?;

        let discovered = lookup.query_all(addresses).await?;
        if discovered.is_empty() {
            info!(topic = %self.inner.topic, "No nodes advertise the topic yet");
        }
        let mut known = BTreeSet::new();
        self.inner.reconcile(&discovered, &mut known).await;

        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            debug!("Lookup polling already running");
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let addresses = addresses.to_vec();
        let interval = config.lookup_poll_interval;
        let span = consumer_span!(topic = %inner.topic, channel = %inner.channel);

        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(interval) => {
                            match lookup.query_all(&addresses).await {
                                Ok(discovered) => inner.reconcile(&discovered, &mut known).await,
                                Err(e) => warn!(error = %e, "Lookup poll failed, keeping current nodes"),
                            }
                        }
                    }
                }
                debug!("Lookup polling stopped");
            }
            .instrument(span),
        );

        *poller = Some(LookupPoller { shutdown_tx, task });
        Ok(())
    }

    async fn connect_to_node(&self, address: &str) -> Result<(), ConsumerError> {
        self.ensure_running()?;
        self.inner.open_node(address).await
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(poller) = self.poller.lock().await.take() {
            let _ = poller.shutdown_tx.send(true);
            let _ = poller.task.await;
        }
        self.inner.close_all().await;
        info!(topic = %self.inner.topic, channel = %self.inner.channel, "Consumer stopped");
    }

    async fn disconnect_from_node(&self, address: &str) -> Result<(), ConsumerError> {
        self.inner.close_node(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HandlerError, Message};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            dial_timeout: Duration::from_millis(500),
            lookup_poll_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_validates_names() {
        assert!(MqttConsumer::create("events", "mailer", ConsumerConfig::default()).is_ok());
        assert!(matches!(
            MqttConsumer::create("bad topic", "mailer", ConsumerConfig::default()),
            Err(ConsumerError::InvalidName { kind: "topic", .. })
        ));
        assert!(matches!(
            MqttConsumer::create("events", "", ConsumerConfig::default()),
            Err(ConsumerError::InvalidName { kind: "channel", .. })
        ));
    }

    #[test]
    fn test_create_keeps_config() {
        let config = ConsumerConfig::default().with_max_attempts(Some(7));
        let consumer = MqttConsumer::create("events", "mailer", config).unwrap();
        assert_eq!(consumer.config().max_attempts, 7);
        assert_eq!(consumer.topic(), "events");
        assert_eq!(consumer.channel(), "mailer");
    }

    #[tokio::test]
    async fn test_add_handler_registers_with_dispatcher() {
        let consumer = MqttConsumer::create("events", "mailer", ConsumerConfig::default()).unwrap();
        consumer.add_handler(Arc::new(|_: &Message| -> Result<(), HandlerError> { Ok(()) }));
        consumer.add_handler(Arc::new(|_: &Message| -> Result<(), HandlerError> { Ok(()) }));
        assert_eq!(consumer.inner.context.dispatcher.handler_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_node() {
        let consumer = MqttConsumer::create("events", "mailer", fast_config()).unwrap();
        let result = consumer.connect_to_node("127.0.0.1:1").await;
        assert!(matches!(result, Err(ConsumerError::Connection { .. })));
        assert!(consumer.connected_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_node() {
        let consumer = MqttConsumer::create("events", "mailer", fast_config()).unwrap();
        let result = consumer.disconnect_from_node("127.0.0.1:1883").await;
        assert!(matches!(result, Err(ConsumerError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_error() {
        let consumer = MqttConsumer::create("events", "mailer", fast_config()).unwrap();
        let result = consumer
            .connect_to_lookups(&["127.0.0.1:1".to_string()])
            .await;
        assert!(matches!(result, Err(ConsumerError::Lookup(_))));
    }

    #[tokio::test]
    async fn test_lookup_with_no_nodes_starts_polling_and_stops() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"producers":[]}"#))
            .mount(&server)
            .await;

        let consumer = MqttConsumer::create("events", "mailer", fast_config()).unwrap();
        consumer.connect_to_lookups(&[server.uri()]).await.unwrap();
        assert!(consumer.poller.lock().await.is_some());

        // Let the poller run a couple of rounds
        tokio::time::sleep(Duration::from_millis(150)).await;
        let polls = server.received_requests().await.unwrap().len();
        assert!(polls >= 2, "expected repeated lookups, saw {polls}");

        tokio::time::timeout(Duration::from_secs(2), consumer.stop())
            .await
            .expect("stop should finish promptly");
        assert!(consumer.poller.lock().await.is_none());
        assert!(matches!(
            consumer.connect_to_node("127.0.0.1:1883").await,
            Err(ConsumerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_reconcile_leaves_direct_nodes_alone() {
        let consumer = MqttConsumer::create("events", "mailer", fast_config()).unwrap();
        let direct = "127.0.0.1:1883".to_string();
        consumer
            .inner
            .nodes
            .lock()
            .await
            .insert(direct.clone(), NodeConnection::detached(&direct));

        let mut known = BTreeSet::new();
        let advertised: BTreeSet<String> = [direct.clone()].into_iter().collect();
        consumer.inner.reconcile(&advertised, &mut known).await;
        assert!(known.is_empty());

        // Lookup stops advertising it; the direct connection stays
        consumer.inner.reconcile(&BTreeSet::new(), &mut known).await;
        assert_eq!(consumer.connected_nodes().await, vec![direct]);
    }
}
