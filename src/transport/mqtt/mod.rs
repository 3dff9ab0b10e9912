//! MQTT consumer transport
//!
//! - [`connection`] - pure address parsing and option building
//! - [`node`] - one event loop task per connected node
//! - [`consumer`] - [`MqttConsumer`], the [`Consumer`](crate::transport::Consumer) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use notifier::transport::mqtt::MqttConsumer;
//! use notifier::transport::Consumer;
//! use notifier::{ConsumerConfig, HandlerError, Message};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let consumer = MqttConsumer::create("events", "mailer", ConsumerConfig::default())?;
//! consumer.add_handler(Arc::new(|message: &Message| -> Result<(), HandlerError> {
//!     println!("{} bytes", message.body().len());
//!     Ok(())
//! }));
//! consumer.connect_to_node("127.0.0.1:1883").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod consumer;
pub mod node;

pub use connection::{parse_node_address, subscription_filter, NodeAddress};
pub use consumer::MqttConsumer;
pub use node::NodeState;
