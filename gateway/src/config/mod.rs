//! Server configuration.
//!
//! Configuration is environment-derived: `.env` values are loaded by `main`
//! before [`ServerConfig::from_env`] reads the process environment. The
//! resulting config is immutable and passed explicitly to every component;
//! there are no ambient singletons.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bind host.
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default bind port.
const DEFAULT_PORT: u16 = 8080;

/// Default upstream dialogue endpoint.
const DEFAULT_UPSTREAM_URL: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

/// Default upstream receive timeout in seconds.
const DEFAULT_RECV_TIMEOUT: u32 = 60;

/// How long to wait for each upstream handshake event.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Silent chunks appended when the browser commits an utterance.
const DEFAULT_COMMIT_TAIL_CHUNKS: usize = 12;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Input modality announced to the dialogue service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputModality {
    #[default]
    Audio,
    Text,
    AudioFile,
}

impl InputModality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Text => "text",
            Self::AudioFile => "audio_file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(Self::Audio),
            "text" => Some(Self::Text),
            "audio_file" => Some(Self::AudioFile),
            _ => None,
        }
    }
}

/// Immutable server configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Local HTTP bind
    pub host: String,
    pub port: u16,

    // Upstream dialogue service
    pub upstream_base_url: String,
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,

    // Session defaults
    pub bot_name: String,
    pub speaker: String,
    pub recv_timeout: u32,
    pub input_mod: InputModality,

    // Audio formats
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_audio_format: String,

    // Journal
    pub save_history: bool,
    pub history_dir: PathBuf,

    // Security
    pub cors_allowed_origins: Option<String>,

    // Tunables (not environment-driven; overridden by tests)
    pub handshake_timeout: Duration,
    pub commit_tail_chunks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            upstream_base_url: DEFAULT_UPSTREAM_URL.to_string(),
            app_id: String::new(),
            access_key: String::new(),
            resource_id: String::new(),
            app_key: String::new(),
            bot_name: "Assistant".to_string(),
            speaker: "zh_female_tianmei_moon_bigtts".to_string(),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            input_mod: InputModality::Audio,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            output_audio_format: "pcm".to_string(),
            save_history: true,
            history_dir: PathBuf::from("./history"),
            cors_allowed_origins: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            commit_tail_chunks: DEFAULT_COMMIT_TAIL_CHUNKS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = env_opt("HOST") {
            config.host = host;
        }
        if let Some(port) = env_opt("PORT") {
            config.port = parse_number("PORT", &port)?;
        }

        if let Some(url) = env_opt("DOUBAO_REALTIME_BASE_URL") {
            config.upstream_base_url = url;
        }
        if let Some(app_id) = env_opt("DOUBAO_APP_ID") {
            config.app_id = app_id;
        }
        if let Some(access_key) = env_opt("DOUBAO_ACCESS_KEY") {
            config.access_key = access_key;
        }
        if let Some(resource_id) = env_opt("DOUBAO_RESOURCE_ID") {
            config.resource_id = resource_id;
        }
        if let Some(app_key) = env_opt("DOUBAO_APP_KEY") {
            config.app_key = app_key;
        }

        if let Some(bot_name) = env_opt("DOUBAO_BOT_NAME") {
            config.bot_name = bot_name;
        }
        if let Some(speaker) = env_opt("DOUBAO_SPEAKER") {
            config.speaker = speaker;
        }
        if let Some(timeout) = env_opt("DOUBAO_RECV_TIMEOUT") {
            config.recv_timeout = parse_number("DOUBAO_RECV_TIMEOUT", &timeout)?;
        }
        if let Some(input_mod) = env_opt("DOUBAO_INPUT_MOD") {
            config.input_mod =
                InputModality::parse(&input_mod).ok_or_else(|| ConfigError::Invalid {
                    key: "DOUBAO_INPUT_MOD",
                    reason: format!("expected audio|text|audio_file, got {input_mod}"),
                })?;
        }

        if let Some(rate) = env_opt("DOUBAO_INPUT_SAMPLE_RATE") {
            config.input_sample_rate = parse_number("DOUBAO_INPUT_SAMPLE_RATE", &rate)?;
        }
        if let Some(rate) = env_opt("DOUBAO_OUTPUT_SAMPLE_RATE") {
            config.output_sample_rate = parse_number("DOUBAO_OUTPUT_SAMPLE_RATE", &rate)?;
        }
        if let Some(format) = env_opt("DOUBAO_OUTPUT_AUDIO_FORMAT") {
            config.output_audio_format = format;
        }

        if let Some(save) = env_opt("SAVE_HISTORY") {
            config.save_history = parse_bool("SAVE_HISTORY", &save)?;
        }
        if let Some(dir) = env_opt("HISTORY_DIR") {
            config.history_dir = PathBuf::from(dir);
        }
        if let Some(origins) = env_opt("CORS_ALLOWED_ORIGINS") {
            config.cors_allowed_origins = Some(origins);
        }

        config.validate()?;
        Ok(config)
    }

    /// The local bind address, `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(10..=120).contains(&self.recv_timeout) {
            return Err(ConfigError::Invalid {
                key: "DOUBAO_RECV_TIMEOUT",
                reason: format!("must be within 10-120, got {}", self.recv_timeout),
            });
        }
        if self.output_audio_format != "pcm" && self.output_audio_format != "pcm_s16le" {
            return Err(ConfigError::Invalid {
                key: "DOUBAO_OUTPUT_AUDIO_FORMAT",
                reason: format!("expected pcm|pcm_s16le, got {}", self.output_audio_format),
            });
        }
        Ok(())
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("not a number: {value}"),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            reason: format!("not a boolean: {other}"),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
