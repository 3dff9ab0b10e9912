//! Delivery and requeue decisions shared by consumer transports
//!
//! A message is handed to one registered handler per attempt. Handler failure
//! requeues it with a linear backoff; once `max_attempts` is exceeded the
//! message is given up and acknowledged so the node stops redelivering it.

use crate::config::ConsumerConfig;
use crate::message::{Handler, Message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Whether a message should be handed to a handler at its current attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    Deliver,
    GiveUp,
}

/// Result of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Handler succeeded, acknowledge the message
    Finished,
    /// Handler failed, redeliver after the delay
    Requeue(Duration),
    /// Attempt limit exceeded, acknowledge without handling
    GaveUp,
}

/// Final outcome of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    GaveUp,
    /// Slots were closed mid-delivery; the message must not be acknowledged
    Abandoned,
}

/// `max_attempts == 0` means unlimited
pub fn decide(attempts: u16, max_attempts: u16) -> DeliveryDecision {
    if max_attempts > 0 && attempts > max_attempts {
        DeliveryDecision::GiveUp
    } else {
        DeliveryDecision::Deliver
    }
}

/// Linear backoff: `requeue_delay * attempts`, capped at `max_requeue_delay`
pub fn requeue_delay(config: &ConsumerConfig, attempts: u16) -> Duration {
    config
        .requeue_delay
        .saturating_mul(u32::from(attempts.max(1)))
        .min(config.max_requeue_delay)
}

/// Handler registry with round-robin selection
pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    next: AtomicUsize,
    max_attempts: u16,
}

impl Dispatcher {
    pub fn new(max_attempts: u16) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            max_attempts,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn Handler>) {
        // A poisoned lock only means a writer panicked mid-push; the Vec is intact
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_handler(&self) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        if handlers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % handlers.len();
        Some(handlers[index].clone())
    }

    /// Run one delivery attempt, advancing the message's attempt counter on failure
    pub async fn attempt(&self, message: &mut Message, config: &ConsumerConfig) -> Attempt {
        if decide(message.attempts(), self.max_attempts) == DeliveryDecision::GiveUp {
            warn!(
                message_id = %message.id(),
                attempts = message.attempts(),
                max_attempts = self.max_attempts,
                "Giving up on message"
            );
            return Attempt::GaveUp;
        }

        let result = match self.next_handler() {
            Some(handler) => handler.handle(message).await.map_err(|e| e.to_string()),
            None => Err("no handler registered".to_string()),
        };

        match result {
            Ok(()) => {
                debug!(message_id = %message.id(), attempts = message.attempts(), "Message finished");
                Attempt::Finished
            }
            Err(reason) => {
                let delay = requeue_delay(config, message.attempts());
                warn!(
                    message_id = %message.id(),
                    attempts = message.attempts(),
                    error = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Handler failed, requeueing message"
                );
                message.record_attempt();
                Attempt::Requeue(delay)
            }
        }
    }

    /// Attempt until the message is finished or given up, sleeping between requeues
    ///
    /// A slot from `slots` is held only while a handler runs, never across a
    /// requeue delay, so one failing message cannot starve the others.
    pub async fn deliver(
        &self,
        mut message: Message,
        config: &ConsumerConfig,
        slots: &Semaphore,
    ) -> Outcome {
        loop {
            let attempt = {
                let Ok(_slot) = slots.acquire().await else {
                    return Outcome::Abandoned;
                };
                self.attempt(&mut message, config).await
            };

            match attempt {
                Attempt::Finished => return Outcome::Finished,
                Attempt::GaveUp => return Outcome::GaveUp,
                Attempt::Requeue(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}
