//! Avatar Voice Configuration
//!
//! Layered settings: `config/default.yaml`, an optional per-environment
//! file, then `AVATAR_VOICE__*` environment variables on top.

mod settings;

pub use settings::{
    load_settings, CaptureSettings, ConnectionSettings, ConversationSettings,
    ObservabilitySettings, PlaybackSettings, Settings,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
