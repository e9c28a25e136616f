//! Realtime voice-assistant gateway.
//!
//! A browser streams microphone audio over a WebSocket; the gateway relays
//! it to an upstream realtime dialogue service speaking a length-prefixed
//! binary framing protocol, and streams synthesized audio and incremental
//! transcripts back. Every meaningful transition is appended to a
//! per-session journal so conversations can be reconstructed.

pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod journal;
pub mod routes;
pub mod sessions;
pub mod state;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use errors::{AppError, AppResult};
pub use state::AppState;
