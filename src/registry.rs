//! # Connection Registry
//!
//! Maps connection identifiers to the outbound half of their transport channel.
//! The registry owns no conversation logic: it only answers "where do bytes for
//! client `X` go?" and forwards them.
//!
//! ## Thread Safety:
//! The map sits behind a `std::sync::RwLock`. Lookups clone the `Arc<dyn Channel>`
//! out of the map and release the lock before sending, so no lock is ever held
//! across an `.await`.

use crate::error::RelayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Outbound half of one client connection.
///
/// Implementations must deliver payloads in the order the calls were made.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), RelayError>;
    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), RelayError>;
}

/// Registry of live connections, shared by every pipeline in the process.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `channel` under `id`, replacing any previous channel for that id.
    pub fn register(&self, id: &str, channel: Arc<dyn Channel>) {
        let replaced = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), channel)
            .is_some();
        debug!(client_id = %id, replaced, "Connection registered");
    }

    /// Remove the channel for `id`. Unknown ids are ignored.
    pub fn unregister(&self, id: &str) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        debug!(client_id = %id, removed, "Connection unregistered");
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn send_text(&self, id: &str, text: impl Into<String>) -> Result<(), RelayError> {
        self.channel(id)?.send_text(text.into()).await
    }

    pub async fn send_binary(&self, id: &str, bytes: Vec<u8>) -> Result<(), RelayError> {
        self.channel(id)?.send_binary(bytes).await
    }

    fn channel(&self, id: &str) -> Result<Arc<dyn Channel>, RelayError> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NoActiveConnection(id.to_string()))
    }
}
