//! Shared application state.

use crate::config::ServerConfig;
use crate::journal::SessionJournal;
use crate::sessions::SessionRegistry;

/// Everything the handlers need, shared via `Arc` through axum's `State`.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: SessionRegistry,
    pub journal: SessionJournal,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let journal = SessionJournal::new(config.history_dir.clone(), config.save_history);
        Self {
            config,
            registry: SessionRegistry::new(),
            journal,
        }
    }
}
