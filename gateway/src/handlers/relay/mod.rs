//! Browser WebSocket relay (attach point, message schema, translation).

mod handler;
pub mod messages;

pub use handler::{relay_handler, COMMIT_CHUNK_BYTES};
