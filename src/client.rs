//! The notify client facade
//!
//! [`NotifyClient`] owns one consumer and one stop signal. It is connected
//! exactly once through a [`Discovery`] strategy; a successful connect spawns a
//! watcher task that waits for [`NotifyClient::close`] and then tears the
//! connection down the way the strategy requires.
//!
//! # Example
//!
//! ```rust,no_run
//! use notifier::{HandlerError, Message, NotifyClient};
//!
//! # tokio_test::block_on(async {
//! let mut client: NotifyClient = NotifyClient::new("events", "mailer", Some(3));
//! client.add_handler(|message: &Message| -> Result<(), HandlerError> {
//!     println!("got {} bytes", message.body().len());
//!     Ok(())
//! });
//! client.connect_lookup(["http://lookup-1:4161"]).await?;
//!
//! // later
//! client.close();
//! # Ok::<(), notifier::NotifyError>(())
//! # });
//! ```

use crate::config::ConsumerConfig;
use crate::error::{FatalError, NotifyError, NotifyResult};
use crate::lifecycle_span;
use crate::message::Handler;
use crate::tls::TlsSettings;
use crate::transport::mqtt::MqttConsumer;
use crate::transport::{Consumer, ConsumerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How a client finds the nodes it consumes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// Ask lookup services for the nodes carrying the topic. The transport
    /// follows membership changes; teardown stops the whole consumer.
    Lookup(Vec<String>),
    /// Connect to one `host:port` node. Teardown disconnects only that node.
    Direct(String),
}

impl Discovery {
    pub fn name(&self) -> &'static str {
        match self {
            Discovery::Lookup(_) => "lookup",
            Discovery::Direct(_) => "direct",
        }
    }

    fn has_addresses(&self) -> bool {
        match self {
            Discovery::Lookup(addresses) => addresses.iter().any(|a| !a.is_empty()),
            Discovery::Direct(address) => !address.is_empty(),
        }
    }

    async fn connect<C: Consumer>(&self, consumer: &C) -> Result<(), ConsumerError> {
        match self {
            Discovery::Lookup(addresses) => consumer.connect_to_lookups(addresses).await,
            Discovery::Direct(address) => consumer.connect_to_node(address).await,
        }
    }

    async fn teardown<C: Consumer>(&self, consumer: &C) {
        match self {
            Discovery::Lookup(_) => consumer.stop().await,
            Discovery::Direct(address) => {
                if let Err(e) = consumer.disconnect_from_node(address).await {
                    warn!(node = %address, error = %e, "Disconnect during teardown failed");
                }
            }
        }
    }
}

/// One-shot stop signal
///
/// The first [`fire`](StopSignal::fire) wins; later calls change nothing and
/// report `false`.
#[derive(Debug)]
pub struct StopSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Returns `true` only for the call that actually fired the signal
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the signal fired or its sender is gone
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    loop {
        let fired = *rx.borrow_and_update();
        if fired || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Consumer facade bound to one topic/channel subscription
pub struct NotifyClient<C: Consumer = MqttConsumer> {
    topic: String,
    channel: String,
    consumer: Arc<C>,
    stop: StopSignal,
    connected: Option<&'static str>,
    watcher: Option<JoinHandle<()>>,
}

impl<C: Consumer> NotifyClient<C> {
    /// Create an unconnected client, panicking if the consumer cannot be created
    ///
    /// `max_attempts` of `None` or `Some(0)` keeps the transport default.
    pub fn new(topic: &str, channel: &str, max_attempts: Option<u16>) -> Self {
        Self::try_new(topic, channel, max_attempts).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_new(
        topic: &str,
        channel: &str,
        max_attempts: Option<u16>,
    ) -> Result<Self, FatalError> {
        let config = ConsumerConfig::default().with_max_attempts(max_attempts);
        Self::with_config(topic, channel, config)
    }

    /// Create an unconnected client that requires transport security,
    /// panicking if the key pair or the consumer cannot be set up
    ///
    /// With both `cert_path` and `key_path` non-empty the key pair is loaded and
    /// presented to nodes. With either empty, no client certificate is used.
    ///
    /// **The node's certificate is never verified.** Traffic is encrypted but
    /// the client accepts any server identity.
    pub fn new_with_tls(
        topic: &str,
        channel: &str,
        max_attempts: Option<u16>,
        cert_path: &str,
        key_path: &str,
    ) -> Self {
        Self::try_new_with_tls(topic, channel, max_attempts, cert_path, key_path)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_new_with_tls(
        topic: &str,
        channel: &str,
        max_attempts: Option<u16>,
        cert_path: &str,
        key_path: &str,
    ) -> Result<Self, FatalError> {
        let settings = TlsSettings::new(cert_path, key_path)?;
        let config = ConsumerConfig::default()
            .with_max_attempts(max_attempts)
            .with_tls(settings);
        Self::with_config(topic, channel, config)
    }

    /// Create an unconnected client from a full transport configuration
    pub fn with_config(
        topic: &str,
        channel: &str,
        config: ConsumerConfig,
    ) -> Result<Self, FatalError> {
        let consumer =
            C::create(topic, channel, config).map_err(|source| FatalError::ConsumerCreation {
                topic: topic.to_string(),
                channel: channel.to_string(),
                source,
            })?;
        debug!(topic, channel, "Created notify client");

        Ok(Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            consumer: Arc::new(consumer),
            stop: StopSignal::new(),
            connected: None,
            watcher: None,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> &ConsumerConfig {
        self.consumer.config()
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Register a message handler with the consumer
    ///
    /// Errors returned by the handler go straight back to the transport, which
    /// requeues the message up to `max_attempts`.
    pub fn add_handler<H: Handler + 'static>(&self, handler: H) {
        self.consumer.add_handler(Arc::new(handler));
    }

    /// Connect using lookup-based discovery
    pub async fn connect_lookup<I, S>(&mut self, addresses: I) -> NotifyResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses = addresses.into_iter().map(Into::into).collect();
        self.connect(Discovery::Lookup(addresses)).await
    }

    /// Connect straight to a single `host:port` node
    pub async fn connect_direct(&mut self, host_port: &str) -> NotifyResult<()> {
        self.connect(Discovery::Direct(host_port.to_string())).await
    }

    /// Connect and start the teardown watcher
    ///
    /// A failed connect leaves the client unconnected, so the call can be retried.
    pub async fn connect(&mut self, discovery: Discovery) -> NotifyResult<()> {
        if self.stop.is_fired() {
            return Err(NotifyError::Closed);
        }
        if let Some(strategy) = self.connected {
            return Err(NotifyError::AlreadyConnected { strategy });
        }
        if !discovery.has_addresses() {
            return Err(NotifyError::NoAddresses);
        }

        discovery
            .connect(self.consumer.as_ref())
            .await
            .map_err(NotifyError::Connect)?;

        let strategy = discovery.name();
        self.connected = Some(strategy);
        info!(topic = %self.topic, channel = %self.channel, strategy, "Connected to queue");

        let consumer = self.consumer.clone();
        let mut stop_rx = self.stop.subscribe();
        let span = lifecycle_span!(topic = %self.topic, channel = %self.channel, strategy);
        self.watcher = Some(tokio::spawn(
            async move {
                wait_for_stop(&mut stop_rx).await;
                info!("Stop signal received, tearing down");
                discovery.teardown(consumer.as_ref()).await;
            }
            .instrument(span),
        ));
        Ok(())
    }

    /// Fire the stop signal; the watcher tears down in the background
    ///
    /// Returns immediately. Calling it again is a no-op.
    pub fn close(&self) {
        if self.stop.fire() {
            debug!(topic = %self.topic, channel = %self.channel, "Stop signal fired");
        } else {
            warn!(topic = %self.topic, channel = %self.channel, "Close called on an already closed client");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_fired()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    /// Wait for the watcher to finish its teardown
    ///
    /// Returns at once when the client never connected.
    pub async fn join(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Teardown watcher ended abnormally");
            }
        }
    }
}
