//! JSON frames exchanged over `/ws`.
//!
//! Requests carry a client-chosen `id` echoed back in the matching `ack`,
//! `history` or `error` frame. `message` frames are unsolicited pushes.

use serde::{Deserialize, Serialize};

use crate::engine::message::Message;
use crate::error::{ChatError, StatusCode};

/// Client → server request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { id: u64, username: String },
    Leave { id: u64 },
    SendMessage { id: u64, body: String },
    ServerPing { id: u64 },
    GetHistory { id: u64 },
}

impl ClientFrame {
    pub fn id(&self) -> u64 {
        match self {
            ClientFrame::Join { id, .. }
            | ClientFrame::Leave { id }
            | ClientFrame::SendMessage { id, .. }
            | ClientFrame::ServerPing { id }
            | ClientFrame::GetHistory { id } => *id,
        }
    }
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        id: u64,
    },
    History {
        id: u64,
        messages: Vec<Message>,
    },
    Error {
        /// `None` when the request could not be parsed far enough to read its id.
        id: Option<u64>,
        code: StatusCode,
        message: String,
    },
    Message {
        message: Message,
    },
}

impl ServerFrame {
    pub fn error(id: Option<u64>, err: &ChatError) -> Self {
        ServerFrame::Error {
            id,
            code: err.status(),
            message: err.to_string(),
        }
    }

    /// The request id this frame answers, if any.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            ServerFrame::Ack { id } | ServerFrame::History { id, .. } => Some(*id),
            ServerFrame::Error { id, .. } => *id,
            ServerFrame::Message { .. } => None,
        }
    }
}
