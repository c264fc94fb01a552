//! Bidirectional route maps for external/internal identifier translation.
//!
//! The LoRa bridge keeps three of these: things (client id ↔ device EUI),
//! channels (channel id ↔ application id) and connections (a self-mapped
//! `channel:thing` membership key). Saving writes both directions; removing
//! deletes both. The trait is the collaborator boundary (a deployment can
//! put a durable store behind it) and the in-memory implementation is what
//! the binary ships with.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Route map failures.
#[derive(Debug, Error)]
pub enum RouteMapError {
    /// No mapping for the requested identifier.
    #[error("route not found")]
    NotFound,

    /// The backing store could not be reached.
    #[error("route store unavailable: {reason}")]
    Unavailable {
        /// Store-reported reason.
        reason: String,
    },
}

/// Durable bidirectional string map.
#[async_trait]
pub trait RouteMap: Send + Sync {
    /// Stores `internal ↔ external`, overwriting either side's previous
    /// pairing.
    async fn save(&self, internal: &str, external: &str) -> Result<(), RouteMapError>;

    /// Looks up the counterpart of `id` in either direction.
    async fn get(&self, id: &str) -> Result<String, RouteMapError>;

    /// Removes the pair containing `id`, whichever side it is on.
    async fn remove(&self, id: &str) -> Result<(), RouteMapError>;
}

/// In-memory route map; two indexes kept consistent under DashMap shards.
#[derive(Debug, Default)]
pub struct InMemoryRouteMap {
    forward: DashMap<String, String>,
    reverse: DashMap<String, String>,
}

impl InMemoryRouteMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteMap for InMemoryRouteMap {
    async fn save(&self, internal: &str, external: &str) -> Result<(), RouteMapError> {
        if let Some(old_external) = self.forward.insert(internal.to_string(), external.to_string())
        {
            if old_external != external {
                self.reverse.remove(&old_external);
            }
        }
        if let Some(old_internal) = self.reverse.insert(external.to_string(), internal.to_string())
        {
            if old_internal != internal {
                self.forward.remove(&old_internal);
            }
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<String, RouteMapError> {
        if let Some(external) = self.forward.get(id) {
            return Ok(external.clone());
        }
        if let Some(internal) = self.reverse.get(id) {
            return Ok(internal.clone());
        }
        Err(RouteMapError::NotFound)
    }

    async fn remove(&self, id: &str) -> Result<(), RouteMapError> {
        if let Some((_, external)) = self.forward.remove(id) {
            self.reverse.remove(&external);
            return Ok(());
        }
        if let Some((_, internal)) = self.reverse.remove(id) {
            self.forward.remove(&internal);
            return Ok(());
        }
        Err(RouteMapError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_is_reversible() {
        let map = InMemoryRouteMap::new();
        map.save("thing-1", "devEUI-1").await.unwrap();

        assert_eq!(map.get("thing-1").await.unwrap(), "devEUI-1");
        assert_eq!(map.get("devEUI-1").await.unwrap(), "thing-1");
    }

    #[tokio::test]
    async fn resave_overwrites_both_directions() {
        let map = InMemoryRouteMap::new();
        map.save("thing-1", "devEUI-1").await.unwrap();
        map.save("thing-1", "devEUI-2").await.unwrap();

        assert_eq!(map.get("thing-1").await.unwrap(), "devEUI-2");
        assert_eq!(map.get("devEUI-2").await.unwrap(), "thing-1");
        assert!(matches!(
            map.get("devEUI-1").await,
            Err(RouteMapError::NotFound)
        ));
    }

    #[tokio::test]
    async fn remove_deletes_both_directions() {
        let map = InMemoryRouteMap::new();
        map.save("thing-1", "devEUI-1").await.unwrap();
        map.remove("devEUI-1").await.unwrap();

        assert!(matches!(
            map.get("thing-1").await,
            Err(RouteMapError::NotFound)
        ));
        assert!(matches!(
            map.get("devEUI-1").await,
            Err(RouteMapError::NotFound)
        ));
    }

    #[tokio::test]
    async fn self_mapped_composite_key_round_trips() {
        let map = InMemoryRouteMap::new();
        map.save("ch-1:thing-1", "ch-1:thing-1").await.unwrap();
        assert_eq!(map.get("ch-1:thing-1").await.unwrap(), "ch-1:thing-1");
    }
}
