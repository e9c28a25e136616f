//! Relay WebSocket route.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::relay_handler;
use crate::state::AppState;

/// `GET /ws?sessionId=...` - WebSocket upgrade into the session relay.
///
/// A missing `sessionId` closes the socket with code 1008 right after the
/// upgrade. Attaching a second socket for the same session displaces the
/// first with code 4001.
pub fn create_relay_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
