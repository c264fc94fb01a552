//! The internal pub/sub bus boundary.
//!
//! All three subsystems meet here: CoAP publishes device writes and
//! subscribes observers, the LoRa bridge republishes uplinks, and the rules
//! engine subscribes to everything. The trait is deliberately thin
//! (subjects and bytes) so brokers stay swappable; [`MessageBusExt`] adds
//! the envelope-aware helpers the adapters actually call.

pub mod nats;

pub use nats::NatsBus;

use crate::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Errors crossing the bus boundary.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker connection could not be established.
    #[error("broker connection failed: {reason}")]
    Connection {
        /// Broker-reported reason.
        reason: String,
    },

    /// The broker rejected or dropped a publication.
    #[error("publish failed: {reason}")]
    PublishFailed {
        /// Broker-reported reason.
        reason: String,
    },

    /// A subscription could not be created.
    #[error("subscribe failed: {reason}")]
    SubscribeFailed {
        /// Broker-reported reason.
        reason: String,
    },

    /// The connection to the broker is gone; the component should restart.
    #[error("broker connection closed")]
    Closed,

    /// A message had no channel or an undecodable envelope.
    #[error("malformed message: {reason}")]
    Malformed {
        /// What failed to decode or validate.
        reason: String,
    },
}

/// A single delivery handed to a [`BusHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the broker matched.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Callback invoked for every delivery on a subscription.
#[async_trait]
pub trait BusHandler: Send + Sync {
    /// Processes one delivery. Errors are logged by the subscription task
    /// and do not cancel the subscription.
    async fn handle(&self, delivery: Delivery) -> Result<(), BusError>;
}

/// Handle to an active subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stops delivery and releases the broker-side subscription.
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}

/// Publish/subscribe over dot subjects with `*` and `>` wildcards.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes raw bytes on a subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribes a handler to a subject pattern.
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

/// Envelope-aware helpers over any [`MessageBus`].
#[async_trait]
pub trait MessageBusExt: MessageBus {
    /// Publishes a [`Message`] on its channel subject as a JSON envelope.
    async fn publish_message(&self, message: &Message) -> Result<(), BusError> {
        if message.channel.is_empty() {
            return Err(BusError::Malformed {
                reason: "message channel is empty".into(),
            });
        }
        let envelope = message.to_envelope().map_err(|e| BusError::Malformed {
            reason: e.to_string(),
        })?;
        self.publish(&message.subject(), envelope.into()).await
    }
}

impl<T: MessageBus + ?Sized> MessageBusExt for T {}
