use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::app_state::AppState;
use super::{rest_api, ws_handler};

/// Build the axum router for one instance: the chat socket plus read-only JSON endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/api/history", get(rest_api::get_history))
        .route("/api/config/limits", get(rest_api::get_limits))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
