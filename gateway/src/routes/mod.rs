//! Router assembly.

pub mod api;
pub mod relay;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// The full application router: HTTP session lifecycle plus the relay
/// attach point. CORS and other outer layers are applied by `main`.
pub fn app(state: Arc<AppState>) -> Router {
    api::create_api_router()
        .merge(relay::create_relay_router())
        .with_state(state)
}
