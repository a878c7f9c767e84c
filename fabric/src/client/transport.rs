//! Seam between the connection manager and whatever carries the RPCs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::message::Message;
use crate::error::ChatResult;

/// What a live connection reports back outside request/response pairs.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message pushed by the server.
    Message(Message),
    /// The connection is gone; no further events follow.
    Closed(String),
}

/// Sending half handed to a connector for one connection.
#[derive(Debug, Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Inbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the manager has stopped listening.
    pub fn message(&self, message: Message) -> bool {
        self.tx.send(TransportEvent::Message(message)).is_ok()
    }

    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Closed(reason.into()));
    }
}

/// Opens connections to one server instance.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, inbox: Inbox) -> ChatResult<Box<dyn HubConnection>>;
}

/// One established connection. Errors come back as the server reported them
/// (`Validation`, `Precondition`) or as `Transport` when the link failed.
#[async_trait]
pub trait HubConnection: Send + Sync {
    async fn join(&self, username: &str) -> ChatResult<()>;

    async fn leave(&self) -> ChatResult<()>;

    async fn send_message(&self, body: &str) -> ChatResult<()>;

    async fn server_ping(&self) -> ChatResult<()>;

    async fn history(&self) -> ChatResult<Vec<Message>>;

    /// Tear the connection down. Never fails.
    async fn close(&self);
}
