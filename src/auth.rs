//! The authorization boundary for device writes.
//!
//! Production deployments back this with the platform's auth service; the
//! adapter only cares about the answer: a publisher identity or a typed
//! denial. [`StaticAuthorizer`] is the in-process implementation used by the
//! binary's standalone mode and by tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;

/// Typed authorization failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The key is unknown or not allowed on the channel.
    #[error("permission denied")]
    PermissionDenied,

    /// The authorization backend could not be reached.
    #[error("authorization unavailable: {reason}")]
    Unavailable {
        /// Transport-level reason.
        reason: String,
    },

    /// The authorization call did not answer in time.
    #[error("authorization timed out")]
    Timeout,

    /// Anything else.
    #[error("authorization failed: {reason}")]
    Internal {
        /// Backend-reported reason.
        reason: String,
    },
}

/// Verifies a device key against a channel.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns the publisher identity behind `key` if it may write to
    /// `channel_id`.
    async fn authorize(&self, channel_id: &str, key: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Clone)]
struct Grant {
    client_id: String,
    channels: HashSet<String>,
}

/// Key-table authorizer for standalone deployments and tests.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    grants: DashMap<String, Grant>,
}

impl StaticAuthorizer {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `key` to publish to `channel_id` as `client_id`.
    pub fn grant(&self, key: &str, client_id: &str, channel_id: &str) {
        self.grants
            .entry(key.to_string())
            .and_modify(|g| {
                g.channels.insert(channel_id.to_string());
            })
            .or_insert_with(|| Grant {
                client_id: client_id.to_string(),
                channels: HashSet::from([channel_id.to_string()]),
            });
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, channel_id: &str, key: &str) -> Result<String, AuthError> {
        let grant = self
            .grants
            .get(key)
            .ok_or(AuthError::PermissionDenied)?;
        if grant.channels.contains(channel_id) {
            Ok(grant.client_id.clone())
        } else {
            Err(AuthError::PermissionDenied)
        }
    }
}
