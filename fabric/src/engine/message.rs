use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a message.
pub type MessageId = Uuid;

/// Sender name reserved for join/leave notifications.
pub const SYSTEM_SENDER: &str = "System";

/// Prefix of the sender name used for server pings (`SERVER:<instance>`).
pub const SERVER_SENDER_PREFIX: &str = "SERVER:";

/// The immutable unit that flows over the bus, into history and out to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub body: String,
    pub is_system: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A message typed by a user.
    pub fn user(sender: impl Into<String>, body: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            body: body.into(),
            is_system: false,
            timestamp: at,
        }
    }

    /// A server-generated notification from the `System` sentinel sender.
    pub fn system(body: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: SYSTEM_SENDER.to_string(),
            body: body.into(),
            is_system: true,
            timestamp: at,
        }
    }

    /// The periodic server time notification.
    pub fn server_ping(instance: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: format!("{SERVER_SENDER_PREFIX}{instance}"),
            body: format!("Server time: {} UTC", at.format("%Y-%m-%d %H:%M:%S")),
            is_system: true,
            timestamp: at,
        }
    }

    pub fn joined(username: &str, at: DateTime<Utc>) -> Self {
        Self::system(format!("{username} joined the chat"), at)
    }

    pub fn left(username: &str, at: DateTime<Utc>) -> Self {
        Self::system(format!("{username} left the chat"), at)
    }
}

/// Issues UTC timestamps that never go backwards for one origin instance,
/// even if the wall clock is stepped back.
#[derive(Debug)]
pub struct MessageClock {
    last: Mutex<DateTime<Utc>>,
}

impl MessageClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now().max(*last);
        *last = now;
        now
    }
}

impl Default for MessageClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_schema_has_five_fields() {
        let msg = Message::user("alice", "hello", Utc::now());
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj.len(), 5);
        for key in ["id", "sender", "body", "is_system", "timestamp"] {
            assert!(obj.contains_key(key), "missing field {key}");
        }

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_system_messages() {
        let at = Utc::now();
        let joined = Message::joined("bob", at);
        assert!(joined.is_system);
        assert_eq!(joined.sender, SYSTEM_SENDER);
        assert_eq!(joined.body, "bob joined the chat");

        let left = Message::left("bob", at);
        assert_eq!(left.body, "bob left the chat");
    }

    #[test]
    fn test_server_ping_format() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T08:05:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let ping = Message::server_ping("node-a", at);

        assert!(ping.is_system);
        assert_eq!(ping.sender, "SERVER:node-a");
        assert_eq!(ping.body, "Server time: 2026-03-01 08:05:09 UTC");
    }

    #[test]
    fn test_ids_are_unique() {
        let at = Utc::now();
        assert_ne!(Message::user("a", "x", at).id, Message::user("a", "x", at).id);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MessageClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }
}
