use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::message::Message;
use super::session::SessionId;

/// Handle returned by [`GroupBroadcaster::register`]; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipHandle {
    channel: String,
    session_id: SessionId,
}

impl MembershipHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

/// Per-instance registry of connected sessions, grouped by channel.
///
/// Owned by one `ChatEngine` and injected wherever fan-out is needed; there is
/// no process-wide registry.
#[derive(Default)]
pub struct GroupBroadcaster {
    groups: DashMap<String, DashMap<SessionId, mpsc::Sender<Message>>>,
}

impl GroupBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session's push channel to a group.
    pub fn register(
        &self,
        channel: &str,
        session_id: SessionId,
        push: mpsc::Sender<Message>,
    ) -> MembershipHandle {
        self.groups
            .entry(channel.to_string())
            .or_default()
            .insert(session_id, push);

        debug!(%session_id, %channel, "session registered");
        MembershipHandle {
            channel: channel.to_string(),
            session_id,
        }
    }

    /// Remove a membership. Returns false if it was already gone.
    pub fn unregister(&self, handle: &MembershipHandle) -> bool {
        let removed = match self.groups.get(&handle.channel) {
            Some(group) => group.remove(&handle.session_id).is_some(),
            None => false,
        };

        // Inner ref is released above; dropping empty groups needs the shard write lock.
        self.groups
            .remove_if(&handle.channel, |_, group| group.is_empty());

        if removed {
            debug!(session_id = %handle.session_id, channel = %handle.channel, "session unregistered");
        }
        removed
    }

    /// Push a message to every session registered on `channel`.
    ///
    /// Never waits on a session: a full or closed outbound queue is logged and
    /// skipped. Returns how many sessions accepted the message.
    pub fn broadcast(&self, channel: &str, message: &Message) -> usize {
        let Some(group) = self.groups.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for member in group.iter() {
            match member.value().try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %member.key(), %channel, "outbound queue full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(session_id = %member.key(), %channel, "outbound queue closed, skipping session");
                }
            }
        }
        delivered
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.groups.get(channel).map(|g| g.len()).unwrap_or(0)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
