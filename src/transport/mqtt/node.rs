//! One live connection to an MQTT data node
//!
//! Each node runs its own event loop task. Every publish takes an unacked slot
//! before its delivery task is spawned and keeps it until the ack is sent.
//! Handler calls additionally take an in-flight slot, released between
//! attempts so requeue delays do not block other messages.

use crate::config::ConsumerConfig;
use crate::message::Message;
use crate::node_span;
use crate::transport::dispatch::{Dispatcher, Outcome};
use crate::transport::ConsumerError;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Outgoing;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

const REQUEST_CAPACITY: usize = 10;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection progress reported by the event loop task
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    Connecting,
    Connected,
    Failed(String),
    Closed,
}

/// Everything a node's event loop needs to deliver messages
#[derive(Clone)]
pub struct DeliveryContext {
    pub filter: String,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<ConsumerConfig>,
    /// Concurrent handler calls
    pub in_flight: Arc<Semaphore>,
    /// Messages received but not yet acknowledged
    pub unacked: Arc<Semaphore>,
}

impl DeliveryContext {
    pub fn new(filter: String, dispatcher: Arc<Dispatcher>, config: Arc<ConsumerConfig>) -> Self {
        Self {
            filter,
            dispatcher,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            unacked: Arc::new(Semaphore::new(config.max_unacked.max(1))),
            config,
        }
    }
}

pub struct NodeConnection {
    address: String,
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NodeConnection {
    /// Connect and subscribe; returns once the node acknowledged the connection
    pub async fn open(
        address: &str,
        options: MqttOptions,
        context: DeliveryContext,
    ) -> Result<Self, ConsumerError> {
        let dial_timeout = context.config.dial_timeout;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(NodeState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(
            run_event_loop(
                address.to_string(),
                client.clone(),
                event_loop,
                context,
                state_tx,
                shutdown_rx,
            )
            .instrument(node_span!(node = %address)),
        );

        match wait_for_connection(state_rx, dial_timeout).await {
            Ok(()) => {
                info!(node = %address, "Connected to node");
                Ok(Self {
                    address: address.to_string(),
                    client,
                    shutdown_tx,
                    task,
                })
            }
            Err(reason) => {
                let _ = shutdown_tx.send(true);
                task.abort();
                Err(ConsumerError::Connection {
                    address: address.to_string(),
                    reason,
                })
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// A connection with no event loop behind it
    #[cfg(test)]
    pub(crate) fn detached(address: &str) -> Self {
        let options = MqttOptions::new("notifier-detached", "127.0.0.1", 1);
        let (client, _event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            address: address.to_string(),
            client,
            shutdown_tx,
            task: tokio::spawn(async {}),
        }
    }

    /// Send a disconnect and wait for the event loop to wind down
    pub async fn close(self) {
        let NodeConnection {
            address,
            client,
            shutdown_tx,
            mut task,
        } = self;

        if let Err(e) = client.try_disconnect() {
            debug!(node = %address, error = %e, "Disconnect request not queued");
        }

        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!(node = %address, "Disconnected from node");
    }
}

/// Wait for the first ConnAck, a failure, or the timeout
async fn wait_for_connection(
    mut state_rx: watch::Receiver<NodeState>,
    timeout: Duration,
) -> Result<(), String> {
    let result = tokio::time::timeout(timeout, async {
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                NodeState::Connected => return Ok(()),
                NodeState::Failed(reason) => return Err(reason),
                NodeState::Closed => return Err("event loop stopped".to_string()),
                NodeState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err("event loop stopped".to_string());
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(format!(
            "no connection acknowledgement within {}ms",
            timeout.as_millis()
        )),
    }
}

async fn run_event_loop(
    address: String,
    client: AsyncClient,
    mut event_loop: EventLoop,
    context: DeliveryContext,
    state_tx: watch::Sender<NodeState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connected_once = false;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Shutdown requested");
                    break;
                }
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected_once = true;
                    let _ = state_tx.send(NodeState::Connected);
                    // Sessions start clean, so every ConnAck needs a fresh subscribe
                    if let Err(e) = client.try_subscribe(context.filter.clone(), QoS::AtLeastOnce) {
                        warn!(filter = %context.filter, error = %e, "Subscribe request failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Immediate unless the node ignores our receive maximum
                    let Ok(slot) = context.unacked.clone().acquire_owned().await else {
                        break;
                    };
                    spawn_delivery(&address, &client, &context, publish, slot);
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    debug!(pkid = suback.pkid, "Subscription confirmed");
                }
                Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                    warn!(reason = ?disconnect.reason_code, "Node closed the connection");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !connected_once {
                        let _ = state_tx.send(NodeState::Failed(e.to_string()));
                        return;
                    }
                    warn!(error = %e, "Node connection error, retrying");
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    let _ = state_tx.send(NodeState::Closed);
}

fn spawn_delivery(
    address: &str,
    client: &AsyncClient,
    context: &DeliveryContext,
    publish: Publish,
    unacked_slot: OwnedSemaphorePermit,
) {
    let client = client.clone();
    let context = context.clone();
    let node = address.to_string();

    tokio::spawn(async move {
        let message = Message::new(publish.payload.clone(), node);
        let message_id = message.id();
        let outcome = context
            .dispatcher
            .deliver(message, &context.config, &context.in_flight)
            .await;

        match outcome {
            Outcome::Abandoned => {
                debug!(message_id = %message_id, "Delivery abandoned, leaving unacknowledged");
            }
            Outcome::Finished | Outcome::GaveUp => {
                if let Err(e) = client.ack(&publish).await {
                    warn!(message_id = %message_id, error = %e, "Failed to acknowledge message");
                }
            }
        }
        drop(unacked_slot);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_connection_success() {
        let (tx, rx) = watch::channel(NodeState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(NodeState::Connected);
            // keep the sender alive until the waiter has seen the value
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        assert!(wait_for_connection(rx, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_failure_reason() {
        let (tx, rx) = watch::channel(NodeState::Connecting);
        tx.send(NodeState::Failed("connection refused".to_string()))
            .unwrap();
        let err = wait_for_connection(rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, "connection refused");
    }

    #[tokio::test]
    async fn test_wait_for_connection_timeout() {
        let (_tx, rx) = watch::channel(NodeState::Connecting);
        let err = wait_for_connection(rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.contains("no connection acknowledgement"));
    }

    #[tokio::test]
    async fn test_open_unreachable_node_fails() {
        use super::super::connection::{configure_mqtt_options, parse_node_address};

        let config = ConsumerConfig {
            dial_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        // Port 1 on loopback refuses connections
        let node = parse_node_address("127.0.0.1:1").unwrap();
        let options = configure_mqtt_options(&node, "mailer", &config);
        let context = DeliveryContext::new(
            "$share/mailer/events".to_string(),
            Arc::new(Dispatcher::new(config.max_attempts)),
            Arc::new(config),
        );

        let result = NodeConnection::open("127.0.0.1:1", options, context).await;
        assert!(matches!(result, Err(ConsumerError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_failing_message_does_not_block_others() {
        use crate::message::HandlerError;
        use std::sync::atomic::{AtomicU32, Ordering};

        let config = ConsumerConfig {
            requeue_delay: Duration::from_millis(400),
            ..Default::default()
        };
        assert_eq!(config.max_in_flight, 1);

        let handled = Arc::new(AtomicU32::new(0));
        let counter = handled.clone();
        let dispatcher = Arc::new(Dispatcher::new(config.max_attempts));
        dispatcher.add_handler(Arc::new(move |m: &Message| -> Result<(), HandlerError> {
            if m.body().as_ref() == b"malformed" {
                return Err(HandlerError::new("cannot parse"));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let context = DeliveryContext::new(
            "$share/mailer/events".to_string(),
            dispatcher,
            Arc::new(config),
        );

        let options = MqttOptions::new("notifier-test", "127.0.0.1", 1);
        // Keep the event loop alive so acks can be queued
        let (client, _event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        for body in ["malformed", "welcome"] {
            let publish = Publish::new("events", QoS::AtLeastOnce, body, None);
            let slot = context.unacked.clone().acquire_owned().await.unwrap();
            spawn_delivery("127.0.0.1:1", &client, &context, publish, slot);
        }

        tokio::time::timeout(Duration::from_millis(300), async {
            while handled.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("good message handled while the failing one backs off");
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unacked_slot_held_until_outcome() {
        let config = ConsumerConfig {
            max_unacked: 1,
            ..Default::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(config.max_attempts));
        dispatcher.add_handler(Arc::new(|_: &Message| -> Result<(), crate::message::HandlerError> {
            Ok(())
        }));
        let context = DeliveryContext::new(
            "$share/mailer/events".to_string(),
            dispatcher,
            Arc::new(config),
        );
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("notifier-test", "127.0.0.1", 1), REQUEST_CAPACITY);

        let slot = context.unacked.clone().acquire_owned().await.unwrap();
        assert_eq!(context.unacked.available_permits(), 0);
        spawn_delivery(
            "127.0.0.1:1",
            &client,
            &context,
            Publish::new("events", QoS::AtLeastOnce, "hello", None),
            slot,
        );

        tokio::time::timeout(Duration::from_secs(1), context.unacked.acquire())
            .await
            .expect("slot released after the ack")
            .unwrap();
    }
}
