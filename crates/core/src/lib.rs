//! Core types for the avatar voice client
//!
//! This crate provides foundational types used across all other crates:
//! - Audio format and chunk types
//! - Per-chunk quality metrics
//! - Error taxonomy
//! - Generation-counted timer slots

pub mod audio;
pub mod error;
pub mod timer;

pub use audio::{
    AudioChunk, AudioFormat, Channels, InboundAudioChunk, QualityMetrics, SampleRate, VideoFormat,
    VideoFrame,
};
pub use error::{Error, Result};
pub use timer::TimerSlot;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in milliseconds since the Unix epoch.
///
/// Used for the `timestamp` field of outbound protocol messages.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
