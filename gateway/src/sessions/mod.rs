//! Session records and the process-wide session registry.
//!
//! A session couples one browser socket with one upstream connection under a
//! single id. The registry is the only shared structure that outlives
//! individual sessions; records reach their transports through the handle,
//! transports reach the record only through the id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::InputModality;
use crate::core::upstream::UpstreamClient;

/// Capacity of the per-session control lane (interrupts).
const CONTROL_CHANNEL_CAPACITY: usize = 8;

// =============================================================================
// Session configuration
// =============================================================================

/// Operator-chosen parameters for one session. Every field is optional;
/// omissions are filled from the server defaults when the upstream session
/// starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaking_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Upstream receive timeout in seconds (10-120).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mod: Option<InputModality>,
}

impl SessionConfig {
    /// Range check for the receive timeout; the enum fields validate through
    /// serde.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(timeout) = self.recv_timeout {
            if !(10..=120).contains(&timeout) {
                return Err(format!("recv_timeout must be within 10-120, got {timeout}"));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Session state
// =============================================================================

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    New,
    UpstreamConnecting,
    Ready,
    Interrupting,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::UpstreamConnecting => write!(f, "upstream_connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Interrupting => write!(f, "interrupting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Where an interruption originated. Shapes both the journal entry and the
/// event payload sent to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    Client,
    Api,
}

impl InterruptSource {
    pub fn journal_tag(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Api => "api",
        }
    }

    pub fn event_tag(self) -> &'static str {
        match self {
            Self::Client => "client_interrupt",
            Self::Api => "interrupt_api",
        }
    }
}

/// Out-of-band commands delivered into the session's relay lane.
#[derive(Debug)]
pub enum ControlCommand {
    Interrupt { source: InterruptSource },
}

// =============================================================================
// Session handle
// =============================================================================

/// Live record of one session.
///
/// The relay task is the single mutation lane; the handle only stores what
/// other lanes need to reach it: the upstream client, the control-channel
/// sender, and the displacement signal for browser-socket replacement.
pub struct SessionHandle {
    id: String,
    config: SessionConfig,
    state: Mutex<SessionState>,
    upstream: Mutex<Option<UpstreamClient>>,
    displace_tx: Mutex<Option<oneshot::Sender<()>>>,
    control_tx: Mutex<Option<mpsc::Sender<ControlCommand>>>,
    closed: AtomicBool,
}

impl SessionHandle {
    pub fn new(id: String, config: SessionConfig) -> Self {
        Self {
            id,
            config,
            state: Mutex::new(SessionState::New),
            upstream: Mutex::new(None),
            displace_tx: Mutex::new(None),
            control_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn set_state(&self, state: SessionState) {
        let mut guard = self.state.lock().await;
        if *guard != state {
            tracing::debug!(session_id = %self.id, from = %*guard, to = %state, "session state");
            *guard = state;
        }
    }

    /// Attach a browser socket, displacing any previous one. Returns the
    /// displacement signal for the new socket and its control-lane receiver.
    pub async fn attach_browser(
        &self,
    ) -> (oneshot::Receiver<()>, mpsc::Receiver<ControlCommand>) {
        if let Some(previous) = self.displace_tx.lock().await.take() {
            tracing::info!(session_id = %self.id, "displacing previous browser socket");
            let _ = previous.send(());
        }

        let (displace_tx, displace_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        *self.displace_tx.lock().await = Some(displace_tx);
        *self.control_tx.lock().await = Some(control_tx);
        (displace_rx, control_rx)
    }

    pub async fn set_upstream(&self, client: UpstreamClient) {
        *self.upstream.lock().await = Some(client);
    }

    pub async fn upstream(&self) -> Option<UpstreamClient> {
        self.upstream.lock().await.clone()
    }

    /// Whether an upstream connection exists and has completed its
    /// session-start exchange.
    pub async fn upstream_started(&self) -> bool {
        self.upstream
            .lock()
            .await
            .as_ref()
            .is_some_and(|u| u.is_started())
    }

    pub async fn control_sender(&self) -> Option<mpsc::Sender<ControlCommand>> {
        self.control_tx.lock().await.clone()
    }

    /// Flip the terminal flag. Only the first caller wins; everyone else
    /// must treat the session as already torn down.
    pub fn close_once(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide mapping of session id to live session record.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the record for `id`, creating one when the id was minted
    /// out-of-band or is unknown. Returns whether a record was created.
    pub fn get_or_create(&self, id: &str, config: SessionConfig) -> (Arc<SessionHandle>, bool) {
        match self.sessions.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle = Arc::new(SessionHandle::new(id.to_string(), config));
                entry.insert(handle.clone());
                (handle, true)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
