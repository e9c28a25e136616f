//! Session lifecycle HTTP routes.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::api::{
    create_session, health_check, history_detail, history_list, interrupt_session,
};
use crate::state::AppState;

/// # Endpoints
///
/// - `POST /session` - mint a session id, returns the WebSocket path
/// - `POST /interrupt` - out-of-band interruption by session id
/// - `GET /history` - session summaries, newest first
/// - `GET /history/{id}` - full event log of one session
/// - `GET /health` - liveness probe
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", post(create_session))
        .route("/interrupt", post(interrupt_session))
        .route("/history", get(history_list))
        .route("/history/{id}", get(history_detail))
        .route("/health", get(health_check))
}
