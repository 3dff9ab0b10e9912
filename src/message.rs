//! Delivered messages and the handler callback contract

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// A message delivered to a handler
///
/// The body is opaque; no decoding is attempted.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    body: Bytes,
    attempts: u16,
    timestamp: DateTime<Utc>,
    node: String,
}

impl Message {
    pub fn new(body: impl Into<Bytes>, node: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
            attempts: 1,
            timestamp: Utc::now(),
            node: node.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Delivery attempt number, starting at 1
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// When the message was first received
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Address of the node the message arrived from
    pub fn node(&self) -> &str {
        &self.node
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// Failure reported by a handler; the transport requeues the message
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Message-processing callback
///
/// Handlers may run concurrently when the consumer allows more than one
/// message in flight.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}
