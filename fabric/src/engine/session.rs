use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broadcaster::MembershipHandle;
use super::chat_engine::ChatEngine;
use super::message::Message;
use super::message_bus::PublishOutcome;
use super::validation::{self, BodyCheck};
use crate::error::{ChatError, ChatResult};

pub type SessionId = Uuid;

/// Maximum queued outbound messages per session (prevents memory exhaustion from slow clients).
pub const MAX_OUTBOUND_QUEUE: usize = 1024;

/// Server-side state of one client connection. Transport-agnostic: the
/// WebSocket handler and the in-process connector both drive it.
///
/// Owned by the connection task. Dropping a joined session unregisters it and
/// emits the leave notification, so a cancelled connection task still cleans up.
pub struct ChatSession {
    id: SessionId,
    engine: Arc<ChatEngine>,
    outbound: mpsc::Sender<Message>,
    channel: String,
    username: Option<String>,
    joined: bool,
    membership: Option<MembershipHandle>,
    closed: bool,
}

impl ChatSession {
    pub(super) fn new(engine: Arc<ChatEngine>, outbound: mpsc::Sender<Message>) -> Self {
        let channel = engine.channel().to_string();
        Self {
            id: Uuid::new_v4(),
            engine,
            outbound,
            channel,
            username: None,
            joined: false,
            membership: None,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn ensure_open(&self) -> ChatResult<()> {
        if self.closed {
            return Err(ChatError::Closed);
        }
        Ok(())
    }

    fn register(&mut self) {
        if self.membership.is_none() {
            let handle =
                self.engine
                    .broadcaster()
                    .register(&self.channel, self.id, self.outbound.clone());
            self.membership = Some(handle);
        }
    }

    fn unregister(&mut self) {
        if let Some(handle) = self.membership.take() {
            self.engine.broadcaster().unregister(&handle);
        }
    }

    // ── Protocol ────────────────────────────────────────────────────

    /// Join the chat under `username` and announce it to every instance.
    pub async fn join(&mut self, username: &str) -> ChatResult<()> {
        self.ensure_open()?;

        if let Err(e) = validation::validate_username(username, self.engine.limits()) {
            warn!(session_id = %self.id, error = %e, "join rejected");
            return Err(e);
        }
        if self.joined {
            return Err(ChatError::precondition("Already joined"));
        }
        if let Some(current) = &self.username
            && current != username
        {
            return Err(ChatError::precondition(format!(
                "Session is already bound to username {current}"
            )));
        }

        self.username = Some(username.to_string());
        self.joined = true;
        self.register();

        info!(session_id = %self.id, %username, channel = %self.channel, "user joined the chat");

        let notice = Message::joined(username, self.engine.now());
        self.engine.publish(&self.channel, notice).await?;
        Ok(())
    }

    /// Leave the chat. No-op when not joined.
    pub async fn leave(&mut self) -> ChatResult<()> {
        if !self.joined {
            return Ok(());
        }
        // Flip first: whatever happens below, the leave is announced at most once.
        self.joined = false;

        let username = self.username.clone().unwrap_or_default();
        info!(session_id = %self.id, %username, "user left the chat");

        let notice = Message::left(&username, self.engine.now());
        let published = self.engine.publish(&self.channel, notice).await;
        self.unregister();
        published.map(|_| ())
    }

    /// Validate and relay a chat message, then record it in history.
    pub async fn send_message(&mut self, body: &str) -> ChatResult<Option<PublishOutcome>> {
        self.ensure_open()?;

        let Some(username) = self.username.clone().filter(|_| self.joined) else {
            warn!(session_id = %self.id, "message sent without joining");
            return Err(ChatError::precondition(
                "Must join chat before sending messages",
            ));
        };

        match validation::validate_body(body, self.engine.limits()) {
            Ok(BodyCheck::Send) => {}
            Ok(BodyCheck::Ignore) => {
                debug!(session_id = %self.id, %username, "ignoring empty message");
                return Ok(None);
            }
            Err(e) => {
                warn!(session_id = %self.id, %username, len = body.chars().count(), "message rejected");
                return Err(e);
            }
        }

        let message = Message::user(username.as_str(), body, self.engine.now());
        debug!(session_id = %self.id, %username, message_id = %message.id, "sending message");

        let outcome = self.engine.publish(&self.channel, message.clone()).await?;
        self.engine.history().append(&self.channel, &message).await;
        Ok(Some(outcome))
    }

    /// Broadcast a server time notice from this instance.
    ///
    /// Allowed before joining; the session is added to the group so it sees the reply.
    pub async fn server_ping(&mut self) -> ChatResult<()> {
        self.ensure_open()?;
        self.register();
        self.engine.server_ping().await.map(|_| ())
    }

    /// Recent history of this session's channel, oldest first.
    pub async fn history(&self) -> ChatResult<Vec<Message>> {
        self.ensure_open()?;
        Ok(self.engine.history().recent(&self.channel).await)
    }

    /// Connection is gone: leave if joined and drop the membership.
    /// Safe to call any number of times.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.leave().await {
            warn!(session_id = %self.id, error = %e, "leave during disconnect failed");
        }
        self.unregister();
        debug!(session_id = %self.id, "session disconnected");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.unregister();

        if !self.joined {
            return;
        }
        self.joined = false;

        let username = self.username.clone().unwrap_or_default();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.id, %username, "no runtime to announce leave on drop");
            return;
        };

        let engine = self.engine.clone();
        let channel = std::mem::take(&mut self.channel);
        let session_id = self.id;
        runtime.spawn(async move {
            info!(%session_id, %username, "user left the chat");
            let notice = Message::left(&username, engine.now());
            if let Err(e) = engine.publish(&channel, notice).await {
                warn!(%session_id, error = %e, "failed to announce leave");
            }
        });
    }
}
