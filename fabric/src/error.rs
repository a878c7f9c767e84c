use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Result alias used across the engine and the client.
pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Rejected input (empty or oversized username/message). Never retried.
    #[error("{0}")]
    Validation(String),

    /// Operation attempted in the wrong session state (e.g. send before join).
    #[error("{0}")]
    Precondition(String),

    /// Connection lost or the shared transport refused a call.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Message bus already has a subscriber")]
    AlreadySubscribed,

    /// Connect or join handshake failed on the client side.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to connect after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Client has been closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ChatError::Precondition(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ChatError::Transport(msg.into())
    }

    /// Status code reported to remote callers.
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::InvalidArgument,
            ChatError::Precondition(_) | ChatError::AlreadySubscribed => {
                StatusCode::FailedPrecondition
            }
            ChatError::Transport(_)
            | ChatError::Connection(_)
            | ChatError::RetriesExhausted { .. }
            | ChatError::Closed => StatusCode::Unavailable,
            ChatError::Store(_) | ChatError::Codec(_) => StatusCode::Internal,
        }
    }

    /// Rebuild an error received from the server.
    pub fn from_status(code: StatusCode, message: String) -> Self {
        match code {
            StatusCode::InvalidArgument => ChatError::Validation(message),
            StatusCode::FailedPrecondition => ChatError::Precondition(message),
            StatusCode::Unavailable => ChatError::Transport(message),
            StatusCode::Internal => ChatError::Connection(message),
        }
    }

    /// Whether the client connection path should try again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ChatError::Validation(_) | ChatError::Precondition(_) | ChatError::Closed
        )
    }
}

/// Wire-level status carried in error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Internal,
}
