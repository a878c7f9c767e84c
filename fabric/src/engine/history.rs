use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::message::Message;
use crate::store::{ListStore, StoreError, with_timeout};

/// Prefix of the list key holding a channel's recent messages.
pub const HISTORY_KEY_PREFIX: &str = "chat:history:";

pub fn history_key(channel: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{channel}")
}

/// Best-effort record of the last `capacity` messages per channel.
///
/// The store keeps entries newest-first (prepend + trim); reads hand them back
/// oldest-first. Store failures never reach the caller.
pub struct HistoryStore {
    store: Arc<dyn ListStore>,
    capacity: usize,
    call_timeout: Duration,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn ListStore>, capacity: usize, call_timeout: Duration) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            call_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a message. Errors are logged and swallowed.
    pub async fn append(&self, channel: &str, message: &Message) {
        if let Err(e) = self.try_append(channel, message).await {
            error!(%channel, error = %e, "failed to save message to history");
        }
    }

    async fn try_append(&self, channel: &str, message: &Message) -> Result<(), StoreError> {
        let key = history_key(channel);
        let payload = serde_json::to_vec(message)?;

        with_timeout(self.call_timeout, self.store.push_front(&key, payload)).await?;
        with_timeout(
            self.call_timeout,
            self.store.trim(&key, 0, self.capacity - 1),
        )
        .await
    }

    /// Up to `capacity` messages, oldest first. Empty on any store failure.
    pub async fn recent(&self, channel: &str) -> Vec<Message> {
        let key = history_key(channel);
        let raw = match with_timeout(
            self.call_timeout,
            self.store.range(&key, 0, self.capacity - 1),
        )
        .await
        {
            Ok(raw) => raw,
            Err(e) => {
                error!(%channel, error = %e, "failed to retrieve history");
                return Vec::new();
            }
        };

        let mut messages: Vec<Message> = raw
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(%channel, error = %e, "skipping malformed history entry");
                    None
                }
            })
            .collect();
        messages.reverse();

        debug!(%channel, count = messages.len(), "retrieved history");
        messages
    }
}
