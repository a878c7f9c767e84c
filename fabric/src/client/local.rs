use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

use super::transport::{Connector, HubConnection, Inbox};
use crate::engine::chat_engine::ChatEngine;
use crate::engine::message::Message;
use crate::engine::session::ChatSession;
use crate::error::{ChatError, ChatResult};

/// Connects straight to an engine in the same process.
///
/// `set_online(false)` makes new connects and every call on existing
/// connections fail with a transport error, the way a dropped network link would.
#[derive(Clone)]
pub struct LocalConnector {
    engine: Arc<ChatEngine>,
    online: Arc<AtomicBool>,
}

impl LocalConnector {
    pub fn new(engine: Arc<ChatEngine>) -> Self {
        Self {
            engine,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn engine(&self) -> &Arc<ChatEngine> {
        &self.engine
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, inbox: Inbox) -> ChatResult<Box<dyn HubConnection>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChatError::transport("connection refused"));
        }

        let (session, mut pushes) = self.engine.open_session();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = pushes.recv().await {
                if !inbox.message(message) {
                    break;
                }
            }
        });

        debug!(session_id = %session.id(), instance = %self.engine.instance_name(), "local connection opened");
        Ok(Box::new(LocalHubConnection {
            session: Mutex::new(Some(session)),
            online: self.online.clone(),
            forwarder,
        }))
    }
}

struct LocalHubConnection {
    session: Mutex<Option<ChatSession>>,
    online: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

impl LocalHubConnection {
    /// The session lock, or a transport error while the link is down.
    async fn lock(&self) -> ChatResult<MutexGuard<'_, Option<ChatSession>>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChatError::transport("connection lost"));
        }
        Ok(self.session.lock().await)
    }
}

fn closed() -> ChatError {
    ChatError::transport("connection closed")
}

#[async_trait]
impl HubConnection for LocalHubConnection {
    async fn join(&self, username: &str) -> ChatResult<()> {
        let mut guard = self.lock().await?;
        let session = guard.as_mut().ok_or_else(closed)?;
        session.join(username).await
    }

    async fn leave(&self) -> ChatResult<()> {
        let mut guard = self.lock().await?;
        let session = guard.as_mut().ok_or_else(closed)?;
        session.leave().await
    }

    async fn send_message(&self, body: &str) -> ChatResult<()> {
        let mut guard = self.lock().await?;
        let session = guard.as_mut().ok_or_else(closed)?;
        session.send_message(body).await.map(|_| ())
    }

    async fn server_ping(&self) -> ChatResult<()> {
        let mut guard = self.lock().await?;
        let session = guard.as_mut().ok_or_else(closed)?;
        session.server_ping().await
    }

    async fn history(&self) -> ChatResult<Vec<Message>> {
        let guard = self.lock().await?;
        let session = guard.as_ref().ok_or_else(closed)?;
        session.history().await
    }

    async fn close(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.disconnect().await;
        }
        self.forwarder.abort();
    }
}
