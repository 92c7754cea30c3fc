//! Audio format, chunk, and quality metric types

use serde::{Deserialize, Serialize};

/// Supported sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz8000,
    Hz16000,
    Hz24000,
    Hz48000,
}

impl SampleRate {
    /// Sample rate in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz48000 => 48000,
        }
    }
}

/// Channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    Mono,
    Stereo,
}

impl Channels {
    /// Number of channels
    pub fn count(&self) -> u32 {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

/// Audio format shared by the capture and playback engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Channel layout
    pub channels: Channels,
    /// Bits per sample (16 or 32)
    pub bits_per_sample: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz16000,
            channels: Channels::Mono,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    /// Bytes of encoded audio per millisecond at this format.
    ///
    /// Only accurate for uncompressed PCM payloads. Wire chunks that declare
    /// their own `duration_ms` take precedence over this estimate.
    pub fn bytes_per_ms(&self) -> f64 {
        let bytes_per_sample = self.bits_per_sample as f64 / 8.0;
        self.sample_rate.as_hz() as f64 * self.channels.count() as f64 * bytes_per_sample / 1000.0
    }

    /// Samples per channel for a chunk of the given duration
    pub fn samples_per_chunk(&self, duration_ms: u64) -> usize {
        (self.sample_rate.as_hz() as u64 * duration_ms / 1000) as usize
    }

    /// Estimated duration in milliseconds of an encoded payload
    pub fn estimate_duration_ms(&self, byte_len: usize) -> f64 {
        byte_len as f64 / self.bytes_per_ms()
    }
}

/// One outbound unit of captured audio.
///
/// Immutable once emitted by the capture engine. `timestamp_ms` is relative
/// to the start of the capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Monotonic per capture session
    pub sequence_number: u64,
    /// Opaque encoded bytes
    pub data: Vec<u8>,
    /// Capture-relative timestamp
    pub timestamp_ms: u64,
}

/// One inbound unit of synthesized audio.
///
/// Owned exclusively by the playback engine from enqueue to drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudioChunk {
    pub sequence_number: u64,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
    /// Optional playback synchronization timestamp
    pub audio_timestamp_ms: Option<u64>,
    /// Declared duration, preferred over byte-size estimation when present
    pub duration_ms: Option<u64>,
}

/// Video frame format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Jpeg,
    H264,
}

/// One inbound synthesized video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub sequence_number: u64,
    pub data: Vec<u8>,
    pub format: VideoFormat,
}

/// Per-chunk signal quality, derived by the capture engine.
///
/// Ephemeral: consumed immediately for VAD and UX metering, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    /// Perceptual volume, 0-100
    pub volume: u8,
    /// RMS level in dBFS
    pub rms_dbfs: f32,
    /// Estimated signal-to-noise ratio in dB
    pub snr_db: f32,
    /// Peak at or near full scale
    pub is_clipping: bool,
    /// RMS below the configured silence threshold
    pub is_silent: bool,
}
