//! Uplink translation and republication.
//!
//! A decoded LoRa uplink becomes a bus message once all three lookups
//! succeed: device EUI to client, application id to channel, and the
//! connection membership between the two. The payload is the decoded
//! `object` when the network server provided one, otherwise the base64
//! `data` field.

use super::{LoraError, RouteMaps, connection_key};
use crate::bus::{BusError, BusHandler, Delivery, MessageBus, MessageBusExt};
use crate::message::{Message, PROTOCOL_LORA};
use crate::routemap::RouteMapError;
use crate::time_provider::Clock;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// A decoded uplink from the LoRa network server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Uplink {
    /// External application identifier.
    #[serde(rename = "applicationID", alias = "application_id")]
    pub application_id: String,
    /// Device EUI.
    #[serde(rename = "devEUI", alias = "dev_eui")]
    pub dev_eui: String,
    /// Base64 raw payload.
    #[serde(default)]
    pub data: Option<String>,
    /// Codec-decoded payload object, when the network server ran one.
    #[serde(default)]
    pub object: Option<serde_json::Value>,
}

/// Resolves uplinks and republishes them on the bus.
pub struct LoraPublisher {
    routes: RouteMaps,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl LoraPublisher {
    /// Creates the publisher.
    pub fn new(routes: RouteMaps, bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Self {
        Self { routes, bus, clock }
    }

    /// Translates one uplink and publishes it; returns the published
    /// message.
    pub async fn handle_uplink(&self, uplink: &Uplink) -> Result<Message, LoraError> {
        let thing_id = match self.routes.things.get(&uplink.dev_eui).await {
            Ok(id) => id,
            Err(RouteMapError::NotFound) => {
                return Err(LoraError::UnknownDevice {
                    dev_eui: uplink.dev_eui.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let channel_id = match self.routes.channels.get(&uplink.application_id).await {
            Ok(id) => id,
            Err(RouteMapError::NotFound) => {
                return Err(LoraError::UnknownApplication {
                    app_id: uplink.application_id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        match self
            .routes
            .connections
            .get(&connection_key(&channel_id, &thing_id))
            .await
        {
            Ok(_) => {}
            Err(RouteMapError::NotFound) => return Err(LoraError::NotConnected),
            Err(e) => return Err(e.into()),
        }

        let payload = decode_payload(uplink)?;
        let message = Message {
            domain: String::new(),
            channel: channel_id,
            subtopic: String::new(),
            publisher: thing_id,
            protocol: PROTOCOL_LORA.to_string(),
            created: self.clock.now_nanos(),
            payload,
        };

        self.bus.publish_message(&message).await?;
        debug!(channel = %message.channel, publisher = %message.publisher, "uplink republished");
        Ok(message)
    }
}

fn decode_payload(uplink: &Uplink) -> Result<Vec<u8>, LoraError> {
    if let Some(object) = &uplink.object {
        if !object.is_null() {
            return serde_json::to_vec(object).map_err(|e| LoraError::MalformedUplink {
                reason: e.to_string(),
            });
        }
    }
    let data = uplink
        .data
        .as_deref()
        .ok_or_else(|| LoraError::MalformedUplink {
            reason: "no data field".to_string(),
        })?;
    BASE64
        .decode(data.as_bytes())
        .map_err(|e| LoraError::MalformedUplink {
            reason: e.to_string(),
        })
}

/// Bus handler decoding uplink JSON from the LoRa ingestion subject.
pub struct UplinkHandler {
    publisher: Arc<LoraPublisher>,
}

impl UplinkHandler {
    /// Wraps a publisher for subscription wiring.
    pub fn new(publisher: Arc<LoraPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl BusHandler for UplinkHandler {
    async fn handle(&self, delivery: Delivery) -> Result<(), BusError> {
        let uplink: Uplink =
            serde_json::from_slice(&delivery.payload).map_err(|e| BusError::Malformed {
                reason: e.to_string(),
            })?;
        if let Err(e) = self.publisher.handle_uplink(&uplink).await {
            warn!(dev_eui = %uplink.dev_eui, error = %e, "uplink dropped");
        }
        Ok(())
    }
}
