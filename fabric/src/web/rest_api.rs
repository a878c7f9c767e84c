use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use super::app_state::AppState;
use crate::engine::message::Message;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Return only the newest `limit` entries.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub channel: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct LimitsResponse {
    pub max_username_length: usize,
    pub max_message_length: usize,
    pub max_history_messages: usize,
}

/// GET /api/history — recent messages of the instance's channel, oldest first.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<HistoryResponse> {
    let mut messages = state.engine.recent_history().await;
    if let Some(limit) = params.limit
        && messages.len() > limit
    {
        let excess = messages.len() - limit;
        messages = messages.split_off(excess);
    }

    Json(HistoryResponse {
        channel: state.engine.channel().to_string(),
        messages,
    })
}

/// GET /api/config/limits — input limits clients should enforce before sending.
pub async fn get_limits(State(state): State<Arc<AppState>>) -> Json<LimitsResponse> {
    let limits = state.engine.limits();
    Json(LimitsResponse {
        max_username_length: limits.max_username_length,
        max_message_length: limits.max_message_length,
        max_history_messages: state.engine.history().capacity(),
    })
}
