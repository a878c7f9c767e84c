use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::app_state::AppState;
use super::protocol::{ClientFrame, ServerFrame};
use crate::engine::chat_engine::ChatEngine;
use crate::engine::session::ChatSession;
use crate::error::{ChatError, StatusCode};

/// Largest request frame accepted from a client.
const MAX_FRAME_BYTES: usize = 64 * 1024;

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let engine = state.engine.clone();
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, engine))
}

/// Drive one WebSocket connection from upgrade to close.
///
/// Requests are handled one at a time in arrival order; pushed messages are
/// forwarded between requests.
async fn handle_socket(socket: WebSocket, engine: Arc<ChatEngine>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let write_handle = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (mut session, mut pushes) = engine.open_session();
    let session_id = session.id();
    info!(%session_id, instance = %engine.instance_name(), "websocket client connected");

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%session_id, error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => dispatch(&mut session, frame).await,
                    Err(e) => ServerFrame::Error {
                        id: None,
                        code: StatusCode::InvalidArgument,
                        message: format!("malformed request: {e}"),
                    },
                };
                if out_tx.send(reply).is_err() {
                    break;
                }
            }
            pushed = pushes.recv() => {
                let Some(message) = pushed else { break };
                if out_tx.send(ServerFrame::Message { message }).is_err() {
                    break;
                }
            }
        }
    }

    session.disconnect().await;
    info!(%session_id, username = session.username().unwrap_or("-"), "websocket client disconnected");

    drop(out_tx);
    if let Err(e) = write_handle.await {
        warn!(%session_id, error = %e, "websocket writer ended abnormally");
    }
}

/// Execute one request against the session and build its reply.
pub async fn dispatch(session: &mut ChatSession, frame: ClientFrame) -> ServerFrame {
    let id = frame.id();
    let result: Result<ServerFrame, ChatError> = match frame {
        ClientFrame::Join { username, .. } => {
            session.join(&username).await.map(|_| ServerFrame::Ack { id })
        }
        ClientFrame::Leave { .. } => session.leave().await.map(|_| ServerFrame::Ack { id }),
        ClientFrame::SendMessage { body, .. } => session
            .send_message(&body)
            .await
            .map(|_| ServerFrame::Ack { id }),
        ClientFrame::ServerPing { .. } => session.server_ping().await.map(|_| ServerFrame::Ack { id }),
        ClientFrame::GetHistory { .. } => session
            .history()
            .await
            .map(|messages| ServerFrame::History { id, messages }),
    };

    result.unwrap_or_else(|e| {
        debug!(session_id = %session.id(), request_id = id, error = %e, "request failed");
        ServerFrame::error(Some(id), &e)
    })
}
