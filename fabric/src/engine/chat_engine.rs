use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::broadcaster::GroupBroadcaster;
use super::history::HistoryStore;
use super::message::{Message, MessageClock};
use super::message_bus::{BusOptions, MessageBus, PublishOutcome};
use super::session::{ChatSession, MAX_OUTBOUND_QUEUE};
use super::validation::Limits;
use crate::config::ServerConfig;
use crate::error::ChatResult;
use crate::store::{ListStore, PubSub};

/// One server instance of the fabric. Protocol-agnostic: the WebSocket
/// handler and the in-process connector both open sessions on it.
///
/// Several engines sharing one store form a cluster: anything published on
/// one reaches the sessions of all of them.
pub struct ChatEngine {
    instance_name: String,
    channel: String,
    limits: Limits,
    /// Sessions connected to this instance. Never shared with other engines.
    broadcaster: Arc<GroupBroadcaster>,
    bus: MessageBus,
    history: HistoryStore,
    clock: MessageClock,
}

impl ChatEngine {
    pub fn new<S>(instance_name: impl Into<String>, config: &ServerConfig, store: Arc<S>) -> Self
    where
        S: PubSub + ListStore + 'static,
    {
        let options = BusOptions::from(&config.bus);
        let call_timeout = options.call_timeout;
        let transport: Arc<dyn PubSub> = store.clone();
        let lists: Arc<dyn ListStore> = store;

        Self {
            instance_name: instance_name.into(),
            channel: config.chat.channel.clone(),
            limits: Limits::from(&config.chat),
            broadcaster: Arc::new(GroupBroadcaster::new()),
            bus: MessageBus::new(transport, options),
            history: HistoryStore::new(lists, config.chat.max_history_messages, call_timeout),
            clock: MessageClock::new(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Subscribe this instance to the bus and fan incoming messages out to
    /// the locally connected sessions.
    pub async fn start(&self) -> ChatResult<()> {
        let broadcaster = self.broadcaster.clone();
        self.bus
            .subscribe(move |envelope| {
                let delivered = broadcaster.broadcast(&envelope.channel, &envelope.message);
                debug!(
                    channel = %envelope.channel,
                    message_id = %envelope.message.id,
                    delivered,
                    "delivered message to local sessions"
                );
                std::future::ready(())
            })
            .await?;

        info!(instance = %self.instance_name, channel = %self.channel, "chat engine started");
        Ok(())
    }

    /// Stop consuming the bus. Connected sessions stay registered but receive nothing further.
    pub async fn shutdown(&self) {
        self.bus.unsubscribe().await;
        info!(instance = %self.instance_name, "chat engine stopped");
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Create the server-side state for a new connection. The receiver yields
    /// every message pushed to the session once it has joined.
    pub fn open_session(self: &Arc<Self>) -> (ChatSession, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(MAX_OUTBOUND_QUEUE);
        let session = ChatSession::new(self.clone(), tx);
        debug!(session_id = %session.id(), instance = %self.instance_name, "session opened");
        (session, rx)
    }

    // ── Messaging ───────────────────────────────────────────────────

    pub async fn publish(&self, channel: &str, message: Message) -> ChatResult<PublishOutcome> {
        self.bus.publish(channel, message).await
    }

    /// Announce this instance's current time to the channel.
    pub async fn server_ping(&self) -> ChatResult<PublishOutcome> {
        let message = Message::server_ping(&self.instance_name, self.now());
        debug!(instance = %self.instance_name, "sending server ping");
        self.publish(&self.channel, message).await
    }

    /// Recent messages of the default channel, oldest first.
    pub async fn recent_history(&self) -> Vec<Message> {
        self.history.recent(&self.channel).await
    }

    /// Next message timestamp; never earlier than the previous one.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn broadcaster(&self) -> &GroupBroadcaster {
        &self.broadcaster
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ChatError;
    use crate::store::MemoryStore;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.bus.store_timeout_ms = 500;
        config
    }

    async fn setup_engine(store: &Arc<MemoryStore>) -> Arc<ChatEngine> {
        let engine = Arc::new(ChatEngine::new("test-1", &config(), store.clone()));
        engine.start().await.unwrap();
        engine
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for push")
            .expect("outbound channel closed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_join_and_message() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut alice, mut rx) = engine.open_session();

        alice.join("alice").await.unwrap();
        let joined = next(&mut rx).await;
        assert!(joined.is_system);
        assert_eq!(joined.body, "alice joined the chat");

        alice.send_message("hello").await.unwrap();
        let msg = next(&mut rx).await;
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.body, "hello");
        assert!(!msg.is_system);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        assert!(matches!(
            engine.start().await,
            Err(ChatError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn test_send_before_join_is_precondition() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, _rx) = engine.open_session();

        assert!(matches!(
            session.send_message("hi").await,
            Err(ChatError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_usernames_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, _rx) = engine.open_session();

        for name in ["", "   "] {
            assert!(matches!(
                session.join(name).await,
                Err(ChatError::Validation(_))
            ));
        }
        assert!(session.join(&"a".repeat(51)).await.is_err());
        assert!(!session.is_joined());
        assert_eq!(engine.broadcaster().member_count("global"), 0);

        session.join(&"a".repeat(50)).await.unwrap();
        assert!(session.is_joined());
    }

    #[tokio::test]
    async fn test_whitespace_body_is_not_broadcast_or_stored() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, mut rx) = engine.open_session();
        session.join("alice").await.unwrap();
        next(&mut rx).await;

        assert_eq!(session.send_message("   ").await.unwrap(), None);
        assert_eq!(session.send_message("").await.unwrap(), None);
        settle().await;

        assert!(rx.try_recv().is_err());
        assert!(engine.recent_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, _rx) = engine.open_session();
        session.join("alice").await.unwrap();

        assert!(session.send_message(&"x".repeat(4000)).await.is_ok());
        assert!(matches!(
            session.send_message(&"x".repeat(4001)).await,
            Err(ChatError::Validation(_))
        ));
        assert_eq!(engine.recent_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_only_user_messages_are_stored() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, _rx) = engine.open_session();

        session.join("alice").await.unwrap();
        session.send_message("one").await.unwrap();
        session.server_ping().await.unwrap();
        session.send_message("two").await.unwrap();
        session.leave().await.unwrap();

        let bodies: Vec<String> = session
            .history()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_rejoin_with_different_name_is_precondition() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, _rx) = engine.open_session();

        session.join("alice").await.unwrap();
        assert!(matches!(
            session.join("alice").await,
            Err(ChatError::Precondition(_))
        ));

        session.leave().await.unwrap();
        assert!(matches!(
            session.join("mallory").await,
            Err(ChatError::Precondition(_))
        ));
        session.join("alice").await.unwrap();
        assert_eq!(session.username(), Some("alice"));
    }

    #[tokio::test]
    async fn test_leave_when_not_joined_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut watcher, mut rx) = engine.open_session();
        watcher.join("watcher").await.unwrap();
        next(&mut rx).await;

        let (mut session, _rx) = engine.open_session();
        session.leave().await.unwrap();
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_disconnect_announces_leave_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut watcher, mut rx) = engine.open_session();
        watcher.join("watcher").await.unwrap();
        next(&mut rx).await;

        let (mut bob, _bob_rx) = engine.open_session();
        bob.join("bob").await.unwrap();
        assert_eq!(next(&mut rx).await.body, "bob joined the chat");

        bob.disconnect().await;
        bob.disconnect().await;
        bob.leave().await.unwrap();
        drop(bob);
        settle().await;

        let mut leaves = 0;
        while let Ok(msg) = rx.try_recv() {
            if msg.body == "bob left the chat" {
                leaves += 1;
            }
        }
        assert_eq!(leaves, 1);
        assert_eq!(engine.broadcaster().member_count("global"), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut watcher, mut rx) = engine.open_session();
        watcher.join("watcher").await.unwrap();
        next(&mut rx).await;

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let (mut carol, _rx) = engine.open_session();
                carol.join("carol").await.unwrap();
                std::future::pending::<()>().await;
            })
        };
        assert_eq!(next(&mut rx).await.body, "carol joined the chat");
        assert_eq!(engine.broadcaster().member_count("global"), 2);

        task.abort();
        let _ = task.await;

        assert_eq!(next(&mut rx).await.body, "carol left the chat");
        assert_eq!(engine.broadcaster().member_count("global"), 1);
    }

    #[tokio::test]
    async fn test_disconnected_session_is_closed() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, _rx) = engine.open_session();
        session.join("alice").await.unwrap();
        session.disconnect().await;

        assert!(matches!(
            session.send_message("late").await,
            Err(ChatError::Closed)
        ));
        assert!(matches!(session.join("alice").await, Err(ChatError::Closed)));
    }

    #[tokio::test]
    async fn test_server_ping_format() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, mut rx) = engine.open_session();

        session.server_ping().await.unwrap();
        let ping = next(&mut rx).await;

        assert_eq!(ping.sender, "SERVER:test-1");
        assert!(ping.is_system);
        assert!(ping.body.starts_with("Server time: "));
        assert!(ping.body.ends_with(" UTC"));
        assert_eq!(ping.body.len(), "Server time: 2024-01-01 00:00:00 UTC".len());
    }

    #[tokio::test]
    async fn test_cross_instance_relay() {
        let store = Arc::new(MemoryStore::new());
        let a = setup_engine(&store).await;
        let b = Arc::new(ChatEngine::new("test-2", &config(), store.clone()));
        b.start().await.unwrap();

        let (mut alice, mut alice_rx) = a.open_session();
        let (mut bob, mut bob_rx) = b.open_session();
        bob.join("bob").await.unwrap();
        next(&mut bob_rx).await;
        alice.join("alice").await.unwrap();

        assert_eq!(next(&mut bob_rx).await.body, "alice joined the chat");
        alice.send_message("across").await.unwrap();

        let seen_by_bob = next(&mut bob_rx).await;
        assert_eq!(seen_by_bob.body, "across");
        next(&mut alice_rx).await;
        assert_eq!(next(&mut alice_rx).await, seen_by_bob);
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;

        let mut last = engine.now();
        for _ in 0..100 {
            let next = engine.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        let engine = setup_engine(&store).await;
        let (mut session, mut rx) = engine.open_session();
        session.join("alice").await.unwrap();
        next(&mut rx).await;

        engine.shutdown().await;
        session.send_message("unheard").await.unwrap();
        settle().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(store.subscriber_count(crate::engine::message_bus::BUS_TOPIC), 0);
    }
}
