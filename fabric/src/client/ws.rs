use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::transport::{Connector, HubConnection, Inbox};
use crate::engine::message::Message;
use crate::error::{ChatError, ChatResult};
use crate::web::protocol::{ClientFrame, ServerFrame};

type Pending = Arc<DashMap<u64, oneshot::Sender<ServerFrame>>>;

/// Connects to a server's `/ws` endpoint.
pub struct WsConnector {
    url: String,
    request_timeout: Duration,
}

impl WsConnector {
    /// `url` is the full socket address, e.g. `ws://127.0.0.1:5000/ws`.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, inbox: Inbox) -> ChatResult<Box<dyn HubConnection>> {
        let (stream, _) = tokio::time::timeout(
            self.request_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| ChatError::transport(format!("timed out connecting to {}", self.url)))?
        .map_err(|e| ChatError::transport(format!("{}: {e}", self.url)))?;

        info!(url = %self.url, "websocket connected");
        let (mut sink, mut reader) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: Pending = Arc::new(DashMap::new());
        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                let reason = loop {
                    let text = match reader.next().await {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => break "server closed the connection".to_string(),
                        Some(Err(e)) => break e.to_string(),
                        Some(Ok(_)) => continue,
                    };

                    let frame = match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed server frame");
                            continue;
                        }
                    };

                    match frame.reply_to() {
                        Some(id) => match pending.remove(&id) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(frame);
                            }
                            None => debug!(request_id = id, "reply for unknown request"),
                        },
                        None => match frame {
                            ServerFrame::Message { message } => {
                                inbox.message(message);
                            }
                            other => warn!(frame = ?other, "server error without request id"),
                        },
                    }
                };

                // Waiters see their sender dropped and fail with a transport error.
                pending.clear();
                inbox.closed(reason);
            })
        };

        Ok(Box::new(WsHubConnection {
            out: out_tx,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
            reader,
            writer,
        }))
    }
}

struct WsHubConnection {
    out: mpsc::UnboundedSender<WsMessage>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsHubConnection {
    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> ChatResult<ServerFrame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = build(id);
        let text = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.out.send(WsMessage::Text(text.into())).is_err() {
            self.pending.remove(&id);
            return Err(ChatError::transport("connection closed"));
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ChatError::transport("connection closed")),
            Err(_) => {
                self.pending.remove(&id);
                return Err(ChatError::transport("request timed out"));
            }
        };

        match reply {
            ServerFrame::Error { code, message, .. } => Err(ChatError::from_status(code, message)),
            reply => Ok(reply),
        }
    }

    async fn expect_ack(&self, build: impl FnOnce(u64) -> ClientFrame) -> ChatResult<()> {
        match self.request(build).await? {
            ServerFrame::Ack { .. } => Ok(()),
            other => Err(ChatError::transport(format!("unexpected reply: {other:?}"))),
        }
    }
}

#[async_trait]
impl HubConnection for WsHubConnection {
    async fn join(&self, username: &str) -> ChatResult<()> {
        let username = username.to_string();
        self.expect_ack(|id| ClientFrame::Join { id, username }).await
    }

    async fn leave(&self) -> ChatResult<()> {
        self.expect_ack(|id| ClientFrame::Leave { id }).await
    }

    async fn send_message(&self, body: &str) -> ChatResult<()> {
        let body = body.to_string();
        self.expect_ack(|id| ClientFrame::SendMessage { id, body }).await
    }

    async fn server_ping(&self) -> ChatResult<()> {
        self.expect_ack(|id| ClientFrame::ServerPing { id }).await
    }

    async fn history(&self) -> ChatResult<Vec<Message>> {
        match self.request(|id| ClientFrame::GetHistory { id }).await? {
            ServerFrame::History { messages, .. } => Ok(messages),
            other => Err(ChatError::transport(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn close(&self) {
        let _ = self.out.send(WsMessage::Close(None));
        self.reader.abort();
        self.pending.clear();
    }
}

impl Drop for WsHubConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
