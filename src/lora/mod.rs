//! LoRa bridge: external application/device identifiers in, internal
//! channel/client identifiers out.
//!
//! Three route maps carry the translation: `things` (client id ↔ device
//! EUI), `channels` (channel id ↔ application id) and `connections`, which
//! stores a self-mapped `channel:thing` membership key.

pub mod events;
pub mod publisher;

pub use events::{BusEventSource, Event, EventHandler, EventSource};
pub use publisher::{LoraPublisher, Uplink, UplinkHandler};

use crate::bus::BusError;
use crate::routemap::{RouteMap, RouteMapError};
use std::sync::Arc;
use thiserror::Error;

/// Bridge failures.
#[derive(Debug, Error)]
pub enum LoraError {
    /// No client is mapped to the uplink's device EUI.
    #[error("unknown device EUI: {dev_eui}")]
    UnknownDevice {
        /// The unmapped EUI.
        dev_eui: String,
    },

    /// No channel is mapped to the uplink's application id.
    #[error("unknown application: {app_id}")]
    UnknownApplication {
        /// The unmapped application id.
        app_id: String,
    },

    /// The device is not connected to the resolved channel.
    #[error("device not connected to channel")]
    NotConnected,

    /// The uplink payload could not be decoded.
    #[error("malformed uplink: {reason}")]
    MalformedUplink {
        /// What failed to decode.
        reason: String,
    },

    /// Route map backend failure.
    #[error(transparent)]
    Route(#[from] RouteMapError),

    /// Bus publish failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// The three maps the bridge maintains.
#[derive(Clone)]
pub struct RouteMaps {
    /// Client id ↔ device EUI.
    pub things: Arc<dyn RouteMap>,
    /// Channel id ↔ application id.
    pub channels: Arc<dyn RouteMap>,
    /// Self-mapped `channel:thing` membership keys.
    pub connections: Arc<dyn RouteMap>,
}

impl RouteMaps {
    /// In-memory maps, one per concern.
    pub fn in_memory() -> Self {
        use crate::routemap::InMemoryRouteMap;
        Self {
            things: Arc::new(InMemoryRouteMap::new()),
            channels: Arc::new(InMemoryRouteMap::new()),
            connections: Arc::new(InMemoryRouteMap::new()),
        }
    }
}

/// Composite membership key for a channel/thing connection.
pub fn connection_key(channel_id: &str, thing_id: &str) -> String {
    format!("{channel_id}:{thing_id}")
}
