//! NATS implementation of the bus boundary.
//!
//! Core NATS pub/sub is enough here: channel subjects are plain dot
//! subjects, and the `*`/`>` wildcard grammar maps one-to-one onto the
//! broker's own. Each subscription owns a forwarding task that decodes
//! nothing; handlers decide what the bytes mean.

use super::{BusError, BusHandler, Delivery, MessageBus, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// NATS connection settings.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Broker URL, e.g. `nats://localhost:4222`.
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

impl NatsConfig {
    /// Reads the broker URL from `EDGEBUS_NATS_URL`.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("EDGEBUS_NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
        }
    }
}

/// Message bus backed by a core NATS client.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connects to the broker.
    pub async fn connect(config: &NatsConfig) -> Result<Self, BusError> {
        info!(url = %config.url, "connecting to NATS");
        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Connection {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::PublishFailed {
                reason: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut subscriber = self.client.subscribe(subject.to_string()).await.map_err(
            |e| BusError::SubscribeFailed {
                reason: e.to_string(),
            },
        )?;

        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_subject = subject.to_string();
        let task: JoinHandle<()> = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        if let Err(e) = subscriber.unsubscribe().await {
                            warn!(subject = %task_subject, error = %e, "unsubscribe failed");
                        }
                        break;
                    }
                    next = subscriber.next() => {
                        let Some(msg) = next else {
                            // Broker closed the subscription; the owning
                            // component restarts externally.
                            warn!(subject = %task_subject, "subscription stream ended");
                            break;
                        };
                        let delivery = Delivery {
                            subject: msg.subject.to_string(),
                            payload: msg.payload,
                        };
                        if let Err(e) = handler.handle(delivery).await {
                            debug!(subject = %task_subject, error = %e, "handler error");
                        }
                    }
                }
            }
        });

        Ok(Box::new(NatsSubscription { token, task }))
    }
}

struct NatsSubscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        self.token.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                return Err(BusError::Connection {
                    reason: format!("subscription task panicked: {e}"),
                });
            }
        }
        Ok(())
    }
}
