//! Wire protocol
//!
//! Tagged JSON messages exchanged over the persistent channel. Audio and
//! video payloads travel base64-encoded; the bytes themselves are opaque to
//! this layer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use avatar_voice_core::{now_ms, AudioChunk, InboundAudioChunk, VideoFormat, VideoFrame};

use crate::TransportError;

/// Messages sent by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake, sent once after the transport connects
    Authenticate {
        token: Option<String>,
        timestamp: u64,
    },
    /// One captured audio chunk
    AudioChunk {
        session_id: String,
        sequence_number: u64,
        audio_data: String,
        timestamp: u64,
    },
    /// End of user utterance (endpointing decision)
    EndUtterance { session_id: String, timestamp: u64 },
    /// Barge-in: stop the in-flight response for this turn
    Interruption {
        session_id: String,
        timestamp: u64,
        turn_index: u64,
    },
}

impl ClientMessage {
    /// Build an `audio_chunk` message from a captured chunk
    pub fn audio_chunk(session_id: &str, chunk: &AudioChunk) -> Self {
        ClientMessage::AudioChunk {
            session_id: session_id.to_string(),
            sequence_number: chunk.sequence_number,
            audio_data: BASE64.encode(&chunk.data),
            timestamp: now_ms(),
        }
    }

    pub fn end_utterance(session_id: &str) -> Self {
        ClientMessage::EndUtterance {
            session_id: session_id.to_string(),
            timestamp: now_ms(),
        }
    }

    pub fn interruption(session_id: &str, turn_index: u64) -> Self {
        ClientMessage::Interruption {
            session_id: session_id.to_string(),
            timestamp: now_ms(),
            turn_index,
        }
    }

    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Internal(e.to_string()))
    }
}

/// Messages received from the conversation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Only valid response to authentication; ends the auth timeout
    SessionCreated {
        session_id: String,
        user_id: String,
        is_guest: bool,
        timestamp: u64,
    },
    /// Handshake rejection; ends the auth timeout
    AuthError {
        code: String,
        message: String,
        timestamp: u64,
    },
    /// Live transcription of the user's speech
    Transcript {
        transcript: String,
        is_final: bool,
        confidence: f32,
    },
    /// The clone started responding
    ResponseStart { turn_id: u64 },
    /// One synthesized audio chunk
    ResponseAudio {
        audio_data: String,
        sequence_number: u64,
        timestamp: u64,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    /// One synthesized video frame
    ResponseVideo {
        frame_data: String,
        sequence_number: u64,
        format: VideoFormat,
    },
    /// The clone finished responding; metrics are opaque to the client
    ResponseEnd {
        #[serde(default)]
        metrics: serde_json::Value,
    },
    /// Service-side error
    Error {
        error_message: String,
        recoverable: bool,
    },
}

impl ServerMessage {
    /// Parse a wire frame. Malformed frames are a protocol error the
    /// session logs and drops; they never crash the state machine.
    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Decode a `response_audio` payload into a playback chunk
    pub fn decode_audio(
        audio_data: &str,
        sequence_number: u64,
        timestamp: u64,
        duration_ms: Option<u64>,
    ) -> Result<InboundAudioChunk, TransportError> {
        let data = BASE64
            .decode(audio_data)
            .map_err(|e| TransportError::Protocol(format!("audio payload: {e}")))?;
        Ok(InboundAudioChunk {
            sequence_number,
            data,
            timestamp_ms: timestamp,
            audio_timestamp_ms: Some(timestamp),
            duration_ms,
        })
    }

    /// Decode a `response_video` payload into a frame
    pub fn decode_video(
        frame_data: &str,
        sequence_number: u64,
        format: VideoFormat,
    ) -> Result<VideoFrame, TransportError> {
        let data = BASE64
            .decode(frame_data)
            .map_err(|e| TransportError::Protocol(format!("video payload: {e}")))?;
        Ok(VideoFrame {
            sequence_number,
            data,
            format,
        })
    }
}
