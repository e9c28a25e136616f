//! Core realtime subsystem: the upstream frame codec and the per-session
//! upstream client.

pub mod protocol;
pub mod upstream;
