//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Connection session configuration
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Audio capture configuration
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Audio playback configuration
    #[serde(default)]
    pub playback: PlaybackSettings,

    /// Turn-taking configuration
    #[serde(default)]
    pub conversation: ConversationSettings,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.connection.url.starts_with("ws://") && !self.connection.url.starts_with("wss://")
        {
            return Err(ConfigError::InvalidValue {
                field: "connection.url".to_string(),
                message: format!("expected a ws:// or wss:// url, got '{}'", self.connection.url),
            });
        }
        if self.connection.auth_timeout_ms < 1_000 {
            return Err(ConfigError::InvalidValue {
                field: "connection.auth_timeout_ms".to_string(),
                message: "handshake timeout too low (minimum 1000ms)".to_string(),
            });
        }
        if !(10..=500).contains(&self.capture.chunk_duration_ms) {
            return Err(ConfigError::InvalidValue {
                field: "capture.chunk_duration_ms".to_string(),
                message: "chunk duration must be between 10ms and 500ms".to_string(),
            });
        }
        if self.playback.buffer_target_ms < self.capture.chunk_duration_ms {
            return Err(ConfigError::InvalidValue {
                field: "playback.buffer_target_ms".to_string(),
                message: "buffer target must cover at least one chunk".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.playback.volume) {
            return Err(ConfigError::InvalidValue {
                field: "playback.volume".to_string(),
                message: "volume must be between 0.0 and 1.0".to_string(),
            });
        }
        if !(0.5..=2.0).contains(&self.playback.speed) {
            return Err(ConfigError::InvalidValue {
                field: "playback.speed".to_string(),
                message: "speed must be between 0.5 and 2.0".to_string(),
            });
        }
        if self.conversation.end_of_utterance_silence_ms < self.capture.chunk_duration_ms {
            return Err(ConfigError::InvalidValue {
                field: "conversation.end_of_utterance_silence_ms".to_string(),
                message: "silence window must cover at least one chunk".to_string(),
            });
        }
        if self.conversation.barge_in_confirmation_ms < self.capture.chunk_duration_ms {
            return Err(ConfigError::InvalidValue {
                field: "conversation.barge_in_confirmation_ms".to_string(),
                message: "confirmation window must cover at least one chunk".to_string(),
            });
        }
        if self.connection.reconnect_enabled && self.connection.reconnect_initial_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.reconnect_initial_delay_ms".to_string(),
                message: "reconnect delay must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Connection session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Conversation service endpoint
    #[serde(default = "default_url")]
    pub url: String,

    /// Bearer token (set via AVATAR_VOICE__CONNECTION__AUTH_TOKEN);
    /// absent means a guest session
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Handshake deadline
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Reconnect after transport drops
    #[serde(default = "default_true")]
    pub reconnect_enabled: bool,

    /// Bound on consecutive reconnection attempts
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

fn default_url() -> String {
    "wss://localhost:8080/ws/conversation".to_string()
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_initial_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            auth_token: None,
            auth_timeout_ms: default_auth_timeout_ms(),
            reconnect_enabled: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Chunk cadence
    #[serde(default = "default_chunk_duration_ms")]
    pub chunk_duration_ms: u64,

    /// RMS level below which a chunk counts as silence
    #[serde(default = "default_silence_threshold_db")]
    pub silence_threshold_db: f32,
}

fn default_chunk_duration_ms() -> u64 {
    100
}
fn default_silence_threshold_db() -> f32 {
    -40.0
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk_duration_ms: default_chunk_duration_ms(),
            silence_threshold_db: default_silence_threshold_db(),
        }
    }
}

/// Audio playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Buffered duration required before playback starts
    #[serde(default = "default_buffer_target_ms")]
    pub buffer_target_ms: u64,

    /// Initial volume, 0.0 to 1.0
    #[serde(default = "default_volume")]
    pub volume: f32,

    /// Initial playback speed, 0.5 to 2.0
    #[serde(default = "default_speed")]
    pub speed: f32,
}

fn default_buffer_target_ms() -> u64 {
    300
}
fn default_volume() -> f32 {
    1.0
}
fn default_speed() -> f32 {
    1.0
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            buffer_target_ms: default_buffer_target_ms(),
            volume: default_volume(),
            speed: default_speed(),
        }
    }
}

/// Turn-taking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    /// Silence required before the utterance is considered finished
    #[serde(default = "default_end_of_utterance_silence_ms")]
    pub end_of_utterance_silence_ms: u64,

    /// Sustained voice activity required to commit a barge-in
    #[serde(default = "default_barge_in_confirmation_ms")]
    pub barge_in_confirmation_ms: u64,

    /// Allow the user to interrupt an in-flight response
    #[serde(default = "default_true")]
    pub barge_in_enabled: bool,
}

fn default_end_of_utterance_silence_ms() -> u64 {
    500
}
fn default_barge_in_confirmation_ms() -> u64 {
    200
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            end_of_utterance_silence_ms: default_end_of_utterance_silence_ms(),
            barge_in_confirmation_ms: default_barge_in_confirmation_ms(),
            barge_in_enabled: true,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (AVATAR_VOICE_ prefix)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::with_name(&format!("config/{env_name}")).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("AVATAR_VOICE")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.connection.auth_timeout_ms, 10_000);
        assert_eq!(settings.capture.chunk_duration_ms, 100);
        assert_eq!(settings.playback.buffer_target_ms, 300);
        assert_eq!(settings.conversation.end_of_utterance_silence_ms, 500);
        assert_eq!(settings.conversation.barge_in_confirmation_ms, 200);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_url() {
        let mut settings = Settings::default();
        settings.connection.url = "http://example.com".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_tiny_buffer() {
        let mut settings = Settings::default();
        settings.playback.buffer_target_ms = 50; // below one 100ms chunk
        assert!(settings.validate().is_err());

        settings.playback.buffer_target_ms = 300;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_out_of_range_speed() {
        let mut settings = Settings::default();
        settings.playback.speed = 3.0;
        assert!(settings.validate().is_err());
    }
}
