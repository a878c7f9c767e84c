use std::sync::Arc;

use crate::engine::chat_engine::ChatEngine;

/// Shared state handed to every axum handler of one instance.
pub struct AppState {
    pub engine: Arc<ChatEngine>,
}
