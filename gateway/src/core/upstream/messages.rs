//! Event codes and message bodies for the upstream dialogue service.

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::sessions::SessionConfig;

// =============================================================================
// Event codes
// =============================================================================

/// Open a fresh connection (client, empty JSON body, no session id).
pub const EVENT_START_CONNECTION: u32 = 1;
/// Tear the connection down (client).
pub const EVENT_FINISH_CONNECTION: u32 = 2;
/// Connection accepted (server).
pub const EVENT_CONNECTION_STARTED: u32 = 50;
/// Begin a dialogue session (client, carries the startup body).
pub const EVENT_START_SESSION: u32 = 100;
/// End the current dialogue session (client); also the interruption primitive.
pub const EVENT_FINISH_SESSION: u32 = 102;
/// Session accepted (server).
pub const EVENT_SESSION_STARTED: u32 = 150;
/// One chunk of input audio (client).
pub const EVENT_AUDIO_TASK: u32 = 200;
/// Ask the bot to greet the user (client).
pub const EVENT_SAY_HELLO: u32 = 300;
/// Session was interrupted; surfaced to the browser (gateway-synthesized).
pub const EVENT_SESSION_INTERRUPTED: u32 = 450;
/// Text query injected into the dialogue (client).
pub const EVENT_CHAT_TEXT_QUERY: u32 = 501;

// =============================================================================
// Start-session body
// =============================================================================

/// ASR section of the start-session body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSection {
    pub extra: AsrExtra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrExtra {
    pub end_smooth_window_ms: u32,
}

/// TTS section of the start-session body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSection {
    pub speaker: String,
    pub audio_config: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub channel: u32,
    pub format: String,
    pub sample_rate: u32,
}

/// Dialogue section of the start-session body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSection {
    pub bot_name: String,
    pub system_role: String,
    pub speaking_style: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub extra: DialogExtra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogExtra {
    pub strict_audit: bool,
    pub recv_timeout: u32,
    pub input_mod: String,
}

/// The full JSON body sent with [`EVENT_START_SESSION`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionBody {
    pub asr: AsrSection,
    pub tts: TtsSection,
    pub dialog: DialogSection,
}

impl StartSessionBody {
    /// Build the startup body for one session. Fields the browser omitted
    /// are filled from the operator defaults.
    pub fn from_config(server: &ServerConfig, session: &SessionConfig) -> Self {
        StartSessionBody {
            asr: AsrSection {
                extra: AsrExtra {
                    end_smooth_window_ms: 1500,
                },
            },
            tts: TtsSection {
                speaker: session
                    .speaker
                    .clone()
                    .unwrap_or_else(|| server.speaker.clone()),
                audio_config: AudioConfig {
                    channel: 1,
                    format: server.output_audio_format.clone(),
                    sample_rate: server.output_sample_rate,
                },
            },
            dialog: DialogSection {
                bot_name: session
                    .bot_name
                    .clone()
                    .unwrap_or_else(|| server.bot_name.clone()),
                system_role: session.system_role.clone().unwrap_or_default(),
                speaking_style: session.speaking_style.clone().unwrap_or_default(),
                location: session
                    .location
                    .clone()
                    .map(|city| Location { city }),
                extra: DialogExtra {
                    strict_audit: false,
                    recv_timeout: session.recv_timeout.unwrap_or(server.recv_timeout),
                    input_mod: session
                        .input_mod
                        .unwrap_or(server.input_mod)
                        .as_str()
                        .to_string(),
                },
            },
        }
    }
}
