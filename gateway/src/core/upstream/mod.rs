//! Client for the upstream realtime dialogue service.

mod client;
pub mod messages;

pub use client::{UpstreamClient, UpstreamError, UpstreamEvent, UpstreamResult, UpstreamSettings};
