//! Client side connection lifecycle: connect, join, retry, reconnect after a
//! lost link, and orderly close.
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──ok──► Connected
//!        ▲                      │                   │ send fails / link lost
//!        │ retries exhausted    ▼ attempt fails     ▼
//!        └───────────────── Reconnecting ◄──────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Connector, HubConnection, Inbox, TransportEvent};
use crate::config::ClientSection;
use crate::engine::message::Message;
use crate::error::{ChatError, ChatResult};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A failure worth showing the user; the manager may already be recovering.
    Error(String),
    /// A message pushed by the server.
    Message(Message),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_millis(3000),
        }
    }
}

impl From<&ClientSection> for ClientOptions {
    fn from(client: &ClientSection) -> Self {
        Self {
            max_reconnect_attempts: client.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(client.reconnect_delay_ms),
        }
    }
}

/// Keeps one joined session alive against a server.
///
/// At most one connect/reconnect sequence runs at a time; a background
/// reconnect takes the same lock as a caller's `connect`.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    state: RwLock<ConnectionState>,
    hub: RwLock<Option<Arc<dyn HubConnection>>>,
    username: StdMutex<Option<String>>,
    reconnect_attempts: AtomicU32,
    /// Serializes connect sequences.
    connect_lock: Mutex<()>,
    /// Bumped on every connect/teardown so stale link-loss reports are ignored.
    generation: AtomicU64,
    reconnecting: AtomicBool,
    reconnect_task: StdMutex<Option<ReconnectTask>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

/// A supervised background reconnect and the token that stops it.
struct ReconnectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let options = ClientOptions {
            max_reconnect_attempts: options.max_reconnect_attempts.max(1),
            ..options
        };
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                state: RwLock::new(ConnectionState::Disconnected),
                hub: RwLock::new(None),
                username: StdMutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                connect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                reconnect_task: StdMutex::new(None),
                pump: StdMutex::new(None),
                shutdown: CancellationToken::new(),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
            }),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        lock(&self.inner.events_rx).take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub fn username(&self) -> Option<String> {
        lock(&self.inner.username).clone()
    }

    /// Failed attempts in the current retry sequence.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Connect and join once. Stops any background reconnect first.
    pub async fn connect(&self, username: &str) -> ChatResult<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.stop_reconnect().await;
        *lock(&inner.username) = Some(username.to_string());

        let result = tokio::select! {
            _ = inner.shutdown.cancelled() => Err(ChatError::Closed),
            result = async {
                let _guard = inner.connect_lock.lock().await;
                inner.connect_locked(username).await
            } => result,
        };

        if let Err(e) = &result {
            inner.set_state(ConnectionState::Disconnected).await;
            inner.emit(ClientEvent::Error(e.to_string()));
        }
        result
    }

    /// Connect and join, retrying with a fixed delay up to the configured limit.
    pub async fn connect_with_retry(&self, username: &str) -> ChatResult<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.stop_reconnect().await;
        *lock(&inner.username) = Some(username.to_string());
        inner.connect_with_retry(&inner.shutdown).await
    }

    /// Send a chat message. A lost link starts a background reconnect and the
    /// error is returned right away; the message is not resent.
    pub async fn send(&self, body: &str) -> ChatResult<()> {
        let hub = self.inner.connected_hub().await?;
        match hub.send_message(body).await {
            Ok(()) => Ok(()),
            Err(e @ (ChatError::Transport(_) | ChatError::Connection(_))) => {
                warn!(error = %e, "connection lost while sending message");
                self.inner
                    .emit(ClientEvent::Error("Connection lost while sending message".into()));
                Inner::spawn_reconnect(&self.inner);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Recent server history, oldest first.
    pub async fn history(&self) -> ChatResult<Vec<Message>> {
        self.inner.connected_hub().await?.history().await
    }

    /// Ask the server to broadcast its time.
    pub async fn server_ping(&self) -> ChatResult<()> {
        self.inner.connected_hub().await?.server_ping().await
    }

    /// Best-effort leave; errors are ignored.
    pub async fn leave(&self) {
        self.inner.leave().await;
    }

    /// Leave, stop any background reconnect and drop the connection.
    /// Idempotent; the manager cannot connect again afterwards.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }

        inner.leave().await;
        inner.shutdown.cancel();
        inner.stop_reconnect().await;

        let _guard = inner.connect_lock.lock().await;
        inner.teardown().await;
        inner.set_state(ConnectionState::Disconnected).await;
        info!("connection manager closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn ensure_open(&self) -> ChatResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ChatError::Closed);
        }
        Ok(())
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }

    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == new_state {
            return;
        }
        debug!(from = ?*state, to = ?new_state, "connection state changed");
        *state = new_state;
        drop(state);
        self.emit(ClientEvent::StateChanged(new_state));
    }

    async fn connected_hub(&self) -> ChatResult<Arc<dyn HubConnection>> {
        self.ensure_open()?;
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ChatError::precondition("Not connected to server"));
        }
        self.hub
            .read()
            .await
            .clone()
            .ok_or_else(|| ChatError::precondition("Not connected to server"))
    }

    async fn leave(&self) {
        let Ok(hub) = self.connected_hub().await else {
            return;
        };
        if let Err(e) = hub.leave().await {
            debug!(error = %e, "ignoring leave failure");
        }
    }

    /// Drop the current connection, if any. Caller holds `connect_lock`.
    async fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            pump.abort();
        }
        let hub = self.hub.write().await.take();
        if let Some(hub) = hub {
            hub.close().await;
        }
    }

    /// One connect + join attempt. Caller holds `connect_lock`.
    async fn connect_locked(self: &Arc<Self>, username: &str) -> ChatResult<()> {
        self.ensure_open()?;
        self.set_state(ConnectionState::Connecting).await;
        self.teardown().await;

        let (inbox, events) = Inbox::channel();
        let hub: Arc<dyn HubConnection> = match self.connector.connect(inbox).await {
            Ok(hub) => Arc::from(hub),
            Err(e @ ChatError::Closed) => return Err(e),
            Err(e) => return Err(ChatError::Connection(e.to_string())),
        };

        if let Err(e) = hub.join(username).await {
            hub.close().await;
            return Err(match e {
                ChatError::Validation(_) | ChatError::Precondition(_) => e,
                other => ChatError::Connection(other.to_string()),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.hub.write().await = Some(hub);
        *lock(&self.pump) = Some(tokio::spawn(Self::pump(self.clone(), events, generation)));

        self.set_state(ConnectionState::Connected).await;
        info!(%username, "connected and joined");
        Ok(())
    }

    /// Retry loop shared by callers and the background reconnect. The
    /// username is read for every attempt, so the latest `connect` wins.
    async fn connect_with_retry(self: &Arc<Self>, cancel: &CancellationToken) -> ChatResult<()> {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let max = self.options.max_reconnect_attempts;

        loop {
            let Some(username) = lock(&self.username).clone() else {
                return Err(ChatError::precondition("No username to connect with"));
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ChatError::Closed),
                result = async {
                    let _guard = self.connect_lock.lock().await;
                    self.connect_locked(&username).await
                } => result,
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !err.is_retryable() {
                self.set_state(ConnectionState::Disconnected).await;
                if !matches!(err, ChatError::Closed) {
                    self.emit(ClientEvent::Error(err.to_string()));
                }
                return Err(err);
            }

            let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(attempts, max, error = %err, "connection attempt failed");
            self.emit(ClientEvent::Error(format!("Connection failed: {err}")));

            if attempts >= max {
                self.set_state(ConnectionState::Disconnected).await;
                return Err(ChatError::RetriesExhausted {
                    attempts,
                    last: err.to_string(),
                });
            }

            self.set_state(ConnectionState::Reconnecting).await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected).await;
                    return Err(ChatError::Closed);
                }
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
        }
    }

    /// Start a supervised reconnect unless one is already running.
    fn spawn_reconnect(this: &Arc<Self>) {
        if this.shutdown.is_cancelled() || this.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = this.shutdown.child_token();
        let generation = this.generation.load(Ordering::SeqCst);
        let inner = this.clone();
        let token = cancel.clone();
        let mut slot = lock(&this.reconnect_task);
        let handle = tokio::spawn(async move {
            inner.reconnect(&token, generation).await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
        *slot = Some(ReconnectTask { cancel, handle });
    }

    /// Cancel the background reconnect, if any, and wait for it to let go of
    /// the connection.
    async fn stop_reconnect(&self) {
        let task = lock(&self.reconnect_task).take();
        let Some(task) = task else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            debug!(error = %e, "reconnect task ended abnormally");
        }
    }

    /// `generation` is the connection that was lost; if another connection
    /// replaced it in the meantime there is nothing to recover.
    async fn reconnect(self: &Arc<Self>, cancel: &CancellationToken, generation: u64) {
        {
            let _guard = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = self.connect_lock.lock() => guard,
            };
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("connection already replaced, skipping reconnect");
                return;
            }
            self.set_state(ConnectionState::Reconnecting).await;
            self.teardown().await;
        }

        info!(username = ?lock(&self.username).clone(), "reconnecting");
        match self.connect_with_retry(cancel).await {
            Ok(()) => info!("reconnected"),
            Err(ChatError::Closed) => debug!("reconnect cancelled"),
            Err(e) => {
                warn!(error = %e, "reconnect gave up");
                self.emit(ClientEvent::Error(format!("Reconnect failed: {e}")));
            }
        }
    }

    /// Forward server pushes to the event channel; report a lost link.
    async fn pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        generation: u64,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => self.emit(ClientEvent::Message(message)),
                TransportEvent::Closed(reason) => {
                    if self.generation.load(Ordering::SeqCst) != generation {
                        break;
                    }
                    warn!(%reason, "connection lost");
                    self.emit(ClientEvent::Error(format!("Connection lost: {reason}")));
                    Self::spawn_reconnect(&self);
                    break;
                }
            }
        }
    }
}
