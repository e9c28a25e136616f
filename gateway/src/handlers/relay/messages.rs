//! Browser-facing WebSocket message schema.
//!
//! JSON text frames both ways, discriminated by `type`. Audio crosses the
//! socket as standard base64 of raw PCM16-LE: 16 kHz from the browser,
//! the advertised output rate (default 24 kHz) from the server.

use serde::{Deserialize, Serialize};

use crate::journal::Role;

// =============================================================================
// Browser -> Gateway
// =============================================================================

/// Incoming messages from the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Begin the conversation; optionally ask the bot to greet first.
    #[serde(rename = "client.start")]
    Start {
        #[serde(default)]
        hello: Option<String>,
    },

    /// One chunk of microphone audio.
    #[serde(rename = "client.audio.append")]
    AudioAppend {
        /// Base64 of raw PCM16-LE at 16 kHz.
        audio: String,
    },

    /// End of the held-button utterance.
    #[serde(rename = "client.audio.commit")]
    AudioCommit,

    /// Typed text instead of speech.
    #[serde(rename = "client.chat.text")]
    ChatText { content: String },

    /// Preempt the response in progress.
    #[serde(rename = "client.interrupt")]
    Interrupt,

    /// Orderly session close.
    #[serde(rename = "client.stop")]
    Stop,
}

// =============================================================================
// Gateway -> Browser
// =============================================================================

/// Outgoing messages to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The session is attached and the upstream handshake completed.
    #[serde(rename = "server.ready")]
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "outputAudioFormat")]
        output_audio_format: String,
    },

    /// One chunk of synthesized speech.
    #[serde(rename = "server.tts.audio")]
    TtsAudio {
        /// Base64 of raw PCM at the advertised output sample rate.
        audio: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<u32>,
    },

    /// An incremental transcript or other textual output.
    #[serde(rename = "server.text")]
    Text { role: Role, text: String },

    /// Any upstream frame without a dedicated translation.
    #[serde(rename = "server.event")]
    Event {
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<u32>,
        payload: serde_json::Value,
    },

    /// A failure the browser should surface or react to.
    #[serde(rename = "server.error")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    /// The upstream connection went away.
    #[serde(rename = "server.closed")]
    Closed { code: u16, reason: String },
}

impl ServerMessage {
    /// A bare error with just a discriminator, e.g. `invalid_json`.
    pub fn error(error: &str) -> Self {
        ServerMessage::Error {
            error: error.to_string(),
            code: None,
            message: None,
            payload: None,
        }
    }
}

/// Routing for the socket sender task: serialized JSON or a close frame.
#[derive(Debug)]
pub enum RelayRoute {
    Message(ServerMessage),
    Close { code: u16, reason: &'static str },
}

// =============================================================================
// Tests
// =============================================================================
