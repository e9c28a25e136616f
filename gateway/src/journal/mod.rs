//! Append-only per-session event journal.
//!
//! Two files per session under the configured base directory:
//!
//! - `<id>.jsonl` - newline-delimited events, append-only, one JSON object
//!   per line.
//! - `<id>.meta.json` - overwrite-in-place summary used by the history
//!   listing.
//!
//! Durability is best-effort: no fsync, but each event is written with a
//! single append so a crash cannot corrupt earlier lines. Readers tolerate a
//! torn last line by skipping anything that does not parse.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many trailing turns feed the derived conversation history.
pub const DEFAULT_HISTORY_TURNS: usize = 12;

/// Event type that increments the `turns` counter.
const TURN_COMPLETED: &str = "turn_completed";

/// Errors from journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        JournalError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(err: serde_json::Error) -> Self {
        JournalError::Serialization(err.to_string())
    }
}

/// Role of a derived conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One journaled event: a single line of the `.jsonl` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// The sidecar summary, overwritten on every append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: u64,
    pub errors: u64,
}

/// A derived message for the legacy single-turn pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
}

/// Per-session journal writer/reader.
///
/// The save-history toggle short-circuits every operation: with the journal
/// disabled, appends are no-ops, the listing is empty and event reads return
/// nothing.
#[derive(Debug, Clone)]
pub struct SessionJournal {
    base_dir: PathBuf,
    enabled: bool,
}

impl SessionJournal {
    pub fn new(base_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Append one event and refresh the sidecar summary.
    pub fn append(
        &self,
        session_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), JournalError> {
        if !self.enabled {
            return Ok(());
        }
        validate_session_id(session_id)?;
        fs::create_dir_all(&self.base_dir)?;

        let now = Utc::now();
        let event = JournalEvent {
            timestamp: now,
            event_type: event_type.to_string(),
            payload,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(session_id))?;
        file.write_all(line.as_bytes())?;

        let mut meta = self
            .read_meta(session_id)
            .unwrap_or_else(|| SessionMeta {
                session_id: session_id.to_string(),
                created_at: now,
                updated_at: now,
                turns: 0,
                errors: 0,
            });
        meta.updated_at = now;
        if event_type == TURN_COMPLETED {
            meta.turns += 1;
        }
        if event_type.contains("error") {
            meta.errors += 1;
        }
        fs::write(self.meta_path(session_id), serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    /// All session summaries, newest `updatedAt` first. Unreadable or
    /// unparsable sidecars are skipped.
    pub fn list(&self) -> Vec<SessionMeta> {
        if !self.enabled {
            return Vec::new();
        }
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut sessions: Vec<SessionMeta> = entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with(".meta.json")
            })
            .filter_map(|e| fs::read(e.path()).ok())
            .filter_map(|raw| serde_json::from_slice(&raw).ok())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// All events of one session, in append order. Blank and malformed lines
    /// are skipped; a missing file reads as empty.
    pub fn events(&self, session_id: &str) -> Vec<JournalEvent> {
        if !self.enabled || validate_session_id(session_id).is_err() {
            return Vec::new();
        }
        let file = match fs::File::open(self.events_path(session_id)) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    /// Conversation context derived from the last `limit` completed turns.
    ///
    /// Only the legacy single-turn pipeline appends `turn_completed`; the
    /// realtime relay never feeds this view.
    pub fn recent_history(&self, session_id: &str, limit: usize) -> Vec<ConversationMessage> {
        let turns: Vec<JournalEvent> = self
            .events(session_id)
            .into_iter()
            .filter(|e| e.event_type == TURN_COMPLETED)
            .collect();

        let skip = turns.len().saturating_sub(limit);
        let mut messages = Vec::new();
        for event in turns.into_iter().skip(skip) {
            if let Some(text) = non_empty_str(&event.payload, "userText") {
                messages.push(ConversationMessage {
                    role: Role::User,
                    text,
                });
            }
            if let Some(text) = non_empty_str(&event.payload, "assistantText") {
                messages.push(ConversationMessage {
                    role: Role::Assistant,
                    text,
                });
            }
        }
        messages
    }

    fn read_meta(&self, session_id: &str) -> Option<SessionMeta> {
        let raw = fs::read(self.meta_path(session_id)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.meta.json"))
    }
}

fn non_empty_str(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Session ids become file names; reject anything that could escape the
/// journal directory.
fn validate_session_id(session_id: &str) -> Result<(), JournalError> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(JournalError::InvalidSessionId(session_id.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
