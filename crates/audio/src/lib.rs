//! Avatar Voice Audio Engines
//!
//! Capture and playback halves of the duplex pipeline:
//! - [`AudioCaptureEngine`]: microphone stream to fixed-duration chunks,
//!   with per-chunk quality metering and voice-activity edges
//! - [`AudioPlaybackEngine`]: ordered, buffer-gated playback of inbound
//!   synthesized chunks with volume/speed/mute controls
//!
//! Both engines talk to hardware through injected device traits, so the
//! state machines run unchanged against in-memory devices in tests.

pub mod capture;
pub mod meter;
pub mod playback;
pub mod vad;

pub use capture::{
    AudioCaptureEngine, AudioInputDevice, CaptureConfig, CaptureEvent, NullInputDevice,
    RecordingState,
};
pub use meter::QualityMeter;
pub use playback::{
    AudioOutputDevice, AudioPlaybackEngine, NullOutputDevice, PlaybackConfig, PlaybackEvent,
    PlaybackParams, PlaybackState,
};
pub use vad::VadDetector;

use thiserror::Error;

/// Audio engine errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device failure: {0}")]
    Device(String),

    #[error("playback failure: {0}")]
    Playback(String),
}
