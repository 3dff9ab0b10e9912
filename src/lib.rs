//! Notifier - queue consumer client
//!
//! A small facade over a topic/channel queue consumer. A [`NotifyClient`] is
//! bound to one topic and one channel, collects message handlers, connects
//! either through lookup services or straight to one data node, and tears the
//! connection down in the background once closed.
//!
//! # Overview
//!
//! - [`client`] - the [`NotifyClient`] facade and its stop signal
//! - [`transport`] - the [`Consumer`] seam, delivery/requeue logic, lookup and
//!   the MQTT data node backend
//! - [`tls`] - key pair loading and client TLS settings
//! - [`config`] - consumer tuning and the `notify-tail` TOML file
//! - [`observability`] - structured logging
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use notifier::{HandlerError, Message, NotifyClient};
//!
//! # tokio_test::block_on(async {
//! let mut client: NotifyClient = NotifyClient::new("notifications", "mailer", None);
//! client.add_handler(|message: &Message| -> Result<(), HandlerError> {
//!     let text = String::from_utf8_lossy(message.body());
//!     println!("attempt {}: {text}", message.attempts());
//!     Ok(())
//! });
//!
//! client.connect_direct("127.0.0.1:1883").await?;
//! client.close();
//! client.join().await;
//! # Ok::<(), notifier::NotifyError>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod observability;
pub mod testing;
pub mod tls;
pub mod transport;

pub use client::{Discovery, NotifyClient, StopSignal};
pub use config::{ConfigError, ConsumerConfig, NotifierConfig, DEFAULT_MAX_ATTEMPTS};
pub use error::{FatalError, NotifyError, NotifyResult};
pub use message::{Handler, HandlerError, Message};
pub use tls::{TlsError, TlsSettings};
pub use transport::mqtt::MqttConsumer;
pub use transport::{Consumer, ConsumerError};
