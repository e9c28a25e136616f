//! HTTP and WebSocket request handlers.
//!
//! - `api` - session lifecycle endpoints and health check
//! - `relay` - browser WebSocket relay to the upstream dialogue service

pub mod api;
pub mod relay;

pub use relay::relay_handler;
