//! Mock implementations for testing
//!
//! [`MockConsumer`] stands in for a queue transport: it records every call the
//! client facade makes and runs deliveries through the real [`Dispatcher`]
//! without waiting out requeue delays.

use crate::config::ConsumerConfig;
use crate::message::{Handler, Message};
use crate::transport::dispatch::{Attempt, Dispatcher, Outcome};
use crate::transport::{validate_channel_name, validate_topic_name, Consumer, ConsumerError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Handler calls after which [`MockConsumer::deliver`] stops redelivering
pub const REDELIVERY_LIMIT: u16 = 100;

/// What happened to one message pushed through [`MockConsumer::deliver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcome: Outcome,
    /// Handler invocations
    pub handler_calls: u16,
    /// Requeues issued after handler failures
    pub requeues: u16,
    /// Requeue delays in the order they were issued
    pub delays: Vec<Duration>,
    /// Attempt counter of the message when it left the consumer
    pub attempts: u16,
}

/// Mock consumer for testing
pub struct MockConsumer {
    pub topic: String,
    pub channel: String,
    config: ConsumerConfig,
    dispatcher: Dispatcher,
    pub lookup_connects: Arc<Mutex<Vec<Vec<String>>>>,
    pub node_connects: Arc<Mutex<Vec<String>>>,
    pub node_disconnects: Arc<Mutex<Vec<String>>>,
    pub stop_calls: AtomicUsize,
    pub connect_failure: Mutex<Option<String>>,
}

impl MockConsumer {
    /// Make every subsequent connect attempt fail with `reason`
    pub async fn fail_connections_with(&self, reason: impl Into<String>) {
        *self.connect_failure.lock().await = Some(reason.into());
    }

    pub async fn allow_connections(&self) {
        *self.connect_failure.lock().await = None;
    }

    pub async fn get_lookup_connects(&self) -> Vec<Vec<String>> {
        self.lookup_connects.lock().await.clone()
    }

    pub async fn get_node_connects(&self) -> Vec<String> {
        self.node_connects.lock().await.clone()
    }

    pub async fn get_node_disconnects(&self) -> Vec<String> {
        self.node_disconnects.lock().await.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.dispatcher.handler_count()
    }

    /// Push one message through the registered handlers
    ///
    /// Requeues are redelivered immediately; their delays are only recorded.
    /// With unlimited attempts a message that keeps failing is abandoned after
    /// [`REDELIVERY_LIMIT`] handler calls.
    pub async fn deliver(&self, body: impl Into<Bytes>) -> DeliveryReport {
        let mut message = Message::new(body, "mock-node:0");
        let mut report = DeliveryReport {
            outcome: Outcome::GaveUp,
            handler_calls: 0,
            requeues: 0,
            delays: Vec::new(),
            attempts: message.attempts(),
        };

        loop {
            let attempt = self.dispatcher.attempt(&mut message, &self.config).await;
            match attempt {
                Attempt::Finished => {
                    report.handler_calls += 1;
                    report.outcome = Outcome::Finished;
                    break;
                }
                Attempt::Requeue(delay) => {
                    report.handler_calls += 1;
                    report.requeues += 1;
                    report.delays.push(delay);
                    if report.handler_calls >= REDELIVERY_LIMIT {
                        report.outcome = Outcome::Abandoned;
                        break;
                    }
                }
                Attempt::GaveUp => {
                    report.outcome = Outcome::GaveUp;
                    break;
                }
            }
        }

        report.attempts = message.attempts();
        report
    }

    async fn check_failure(&self, address: &str) -> Result<(), ConsumerError> {
        match self.connect_failure.lock().await.as_ref() {
            Some(reason) => Err(ConsumerError::Connection {
                address: address.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    fn create(topic: &str, channel: &str, config: ConsumerConfig) -> Result<Self, ConsumerError> {
        validate_topic_name(topic)?;
        validate_channel_name(channel)?;

        Ok(Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            dispatcher: Dispatcher::new(config.max_attempts),
            config,
            lookup_connects: Arc::new(Mutex::new(Vec::new())),
            node_connects: Arc::new(Mutex::new(Vec::new())),
            node_disconnects: Arc::new(Mutex::new(Vec::new())),
            stop_calls: AtomicUsize::new(0),
            connect_failure: Mutex::new(None),
        })
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn add_handler(&self, handler: Arc<dyn Handler>) {
        self.dispatcher.add_handler(handler);
    }

    async fn connect_to_lookups(&self, addresses: &[String]) -> Result<(), ConsumerError> {
        self.check_failure(&addresses.join(",")).await?;
        self.lookup_connects.lock().await.push(addresses.to_vec());
        Ok(())
    }

    async fn connect_to_node(&self, address: &str) -> Result<(), ConsumerError> {
        self.check_failure(address).await?;
        self.node_connects.lock().await.push(address.to_string());
        Ok(())
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnect_from_node(&self, address: &str) -> Result<(), ConsumerError> {
        self.node_disconnects.lock().await.push(address.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HandlerError;

    fn zero_delay(max_attempts: Option<u16>) -> ConsumerConfig {
        ConsumerConfig {
            requeue_delay: Duration::ZERO,
            ..Default::default()
        }
        .with_max_attempts(max_attempts)
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let consumer = MockConsumer::create("events", "mailer", ConsumerConfig::default()).unwrap();
        consumer
            .connect_to_lookups(&["l1:4161".to_string()])
            .await
            .unwrap();
        consumer.connect_to_node("n1:1883").await.unwrap();
        consumer.disconnect_from_node("n1:1883").await.unwrap();
        consumer.stop().await;

        assert_eq!(consumer.get_lookup_connects().await, vec![vec!["l1:4161".to_string()]]);
        assert_eq!(consumer.get_node_connects().await, vec!["n1:1883".to_string()]);
        assert_eq!(consumer.get_node_disconnects().await, vec!["n1:1883".to_string()]);
        assert_eq!(consumer.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_connection_failure() {
        let consumer = MockConsumer::create("events", "mailer", ConsumerConfig::default()).unwrap();
        consumer.fail_connections_with("refused").await;
        assert!(matches!(
            consumer.connect_to_node("n1:1883").await,
            Err(ConsumerError::Connection { .. })
        ));
        assert!(consumer.get_node_connects().await.is_empty());

        consumer.allow_connections().await;
        assert!(consumer.connect_to_node("n1:1883").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_deliver_with_failing_handler() {
        let consumer = MockConsumer::create("events", "mailer", zero_delay(Some(3))).unwrap();
        consumer.add_handler(Arc::new(|_: &Message| -> Result<(), HandlerError> {
            Err(HandlerError::new("nope"))
        }));

        let report = consumer.deliver("payload").await;
        assert_eq!(report.outcome, Outcome::GaveUp);
        assert_eq!(report.handler_calls, 3);
        assert_eq!(report.requeues, 3);
        assert_eq!(report.attempts, 4);
    }

    #[tokio::test]
    async fn test_mock_deliver_unlimited_attempts_terminates() {
        let config = ConsumerConfig {
            max_attempts: 0,
            requeue_delay: Duration::ZERO,
            ..Default::default()
        };
        let consumer = MockConsumer::create("events", "mailer", config).unwrap();
        consumer.add_handler(Arc::new(|_: &Message| -> Result<(), HandlerError> {
            Err(HandlerError::new("nope"))
        }));

        let report = tokio::time::timeout(Duration::from_secs(5), consumer.deliver("payload"))
            .await
            .expect("delivery must end");
        assert_eq!(report.outcome, Outcome::Abandoned);
        assert_eq!(report.handler_calls, REDELIVERY_LIMIT);
    }

    #[tokio::test]
    async fn test_mock_deliver_success() {
        let consumer = MockConsumer::create("events", "mailer", zero_delay(None)).unwrap();
        consumer.add_handler(Arc::new(|m: &Message| -> Result<(), HandlerError> {
            assert_eq!(m.body().as_ref(), b"payload");
            Ok(())
        }));

        let report = consumer.deliver("payload").await;
        assert_eq!(report.outcome, Outcome::Finished);
        assert_eq!(report.handler_calls, 1);
        assert_eq!(report.requeues, 0);
    }

    #[test]
    fn test_mock_create_validates_names() {
        assert!(MockConsumer::create("", "mailer", ConsumerConfig::default()).is_err());
        assert!(MockConsumer::create("events", "bad channel", ConsumerConfig::default()).is_err());
    }
}
