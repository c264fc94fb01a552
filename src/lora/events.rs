//! Provisioning event consumption.
//!
//! Entity lifecycle events flow in through a generic pull iterator and keep
//! the route maps current. A thing or group without the LoRa metadata its
//! operation requires is skipped (or, in strict mode, aborts the stream so
//! the supervisor restarts it); repository failures always abort.

use super::{RouteMaps, connection_key};
use crate::bus::{BusError, BusHandler, Delivery, MessageBus, Subscription};
use crate::routemap::{RouteMap, RouteMapError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event stream failures.
#[derive(Debug, Error)]
pub enum EventError {
    /// The underlying stream broke.
    #[error("event stream failed: {reason}")]
    Stream {
        /// Transport-reported reason.
        reason: String,
    },

    /// Required LoRa metadata was absent (strict mode only).
    #[error("event {id}: missing {field}")]
    MissingMetadata {
        /// Entity id carried by the event.
        id: String,
        /// The metadata field that was required.
        field: String,
    },

    /// Route map backend failure; aborts the stream for restart.
    #[error(transparent)]
    Route(#[from] RouteMapError),
}

/// One provisioning event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Event {
    /// Operation tag, e.g. `thing.create`.
    pub operation: String,
    /// Entity id.
    #[serde(default)]
    pub id: String,
    /// Entity metadata; LoRa routes live under `lora`.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Group (channel) id for connect/disconnect events.
    #[serde(default)]
    pub group_id: String,
    /// Member (thing) ids for connect/disconnect events.
    #[serde(default)]
    pub member_ids: Vec<String>,
}

impl Event {
    fn lora_metadata(&self, field: &str) -> Option<String> {
        self.metadata
            .as_ref()?
            .get("lora")?
            .get(field)?
            .as_str()
            .map(str::to_string)
    }
}

/// Pull iterator over provisioning events.
#[async_trait]
pub trait EventSource: Send {
    /// Next event; `Ok(None)` ends the stream.
    async fn next(&mut self) -> Result<Option<Event>, EventError>;
}

/// Applies provisioning events to the route maps.
pub struct EventHandler {
    routes: RouteMaps,
    strict: bool,
}

impl EventHandler {
    /// Creates a handler; `strict` turns missing metadata into stream-fatal
    /// errors.
    pub fn new(routes: RouteMaps, strict: bool) -> Self {
        Self { routes, strict }
    }

    /// Consumes the source until it ends or fails.
    pub async fn run(&self, source: &mut dyn EventSource) -> Result<(), EventError> {
        while let Some(event) = source.next().await? {
            self.handle(&event).await?;
        }
        info!("provisioning event stream ended");
        Ok(())
    }

    /// Applies a single event.
    pub async fn handle(&self, event: &Event) -> Result<(), EventError> {
        match event.operation.as_str() {
            "thing.create" | "thing.update" => {
                self.save_mapped(event, "dev_eui", &self.routes.things).await
            }
            "thing.remove" => remove_quiet(&self.routes.things, &event.id).await,
            "group.create" | "group.update" => {
                self.save_mapped(event, "app_id", &self.routes.channels).await
            }
            "group.remove" => remove_quiet(&self.routes.channels, &event.id).await,
            "thing.connect" => self.connect(event, true).await,
            "thing.disconnect" => self.connect(event, false).await,
            other => {
                debug!(operation = %other, "ignoring unrelated event");
                Ok(())
            }
        }
    }

    async fn save_mapped(
        &self,
        event: &Event,
        field: &str,
        map: &Arc<dyn RouteMap>,
    ) -> Result<(), EventError> {
        let Some(external) = event.lora_metadata(field) else {
            if self.strict {
                return Err(EventError::MissingMetadata {
                    id: event.id.clone(),
                    field: field.to_string(),
                });
            }
            debug!(id = %event.id, field, "event without LoRa metadata, skipping");
            return Ok(());
        };
        map.save(&event.id, &external).await?;
        debug!(id = %event.id, external = %external, "route saved");
        Ok(())
    }

    async fn connect(&self, event: &Event, join: bool) -> Result<(), EventError> {
        for member in &event.member_ids {
            let key = connection_key(&event.group_id, member);
            if join {
                self.routes.connections.save(&key, &key).await?;
            } else {
                remove_quiet(&self.routes.connections, &key).await?;
            }
        }
        Ok(())
    }
}

async fn remove_quiet(map: &Arc<dyn RouteMap>, id: &str) -> Result<(), EventError> {
    match map.remove(id).await {
        Ok(()) | Err(RouteMapError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Event source fed by a bus subscription carrying JSON events.
pub struct BusEventSource {
    rx: mpsc::Receiver<Event>,
    _subscription: Box<dyn Subscription>,
}

impl BusEventSource {
    /// Subscribes to `subject` and decodes each delivery as an [`Event`].
    pub async fn subscribe(
        bus: &dyn MessageBus,
        subject: &str,
    ) -> Result<Self, BusError> {
        let (tx, rx) = mpsc::channel(256);
        let subscription = bus.subscribe(subject, Arc::new(EventDecoder { tx })).await?;
        Ok(Self {
            rx,
            _subscription: subscription,
        })
    }
}

#[async_trait]
impl EventSource for BusEventSource {
    async fn next(&mut self) -> Result<Option<Event>, EventError> {
        Ok(self.rx.recv().await)
    }
}

struct EventDecoder {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl BusHandler for EventDecoder {
    async fn handle(&self, delivery: Delivery) -> Result<(), BusError> {
        match serde_json::from_slice::<Event>(&delivery.payload) {
            Ok(event) => {
                if self.tx.send(event).await.is_err() {
                    warn!("event consumer gone, dropping event");
                }
                Ok(())
            }
            Err(e) => Err(BusError::Malformed {
                reason: e.to_string(),
            }),
        }
    }
}
