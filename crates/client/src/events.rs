//! Conversation events surfaced to the UI layer

use avatar_voice_core::{QualityMetrics, VideoFrame};

use crate::conversation::ConversationState;

/// Events published by the orchestrator
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StateChanged {
        old: ConversationState,
        new: ConversationState,
    },
    /// The handshake completed and a conversation session exists
    SessionReady { session_id: String },
    /// Live transcription of the user's speech
    Transcript {
        transcript: String,
        is_final: bool,
        confidence: f32,
    },
    /// The clone started responding
    ResponseStarted { turn_id: u64 },
    /// The clone finished responding
    ResponseEnded,
    /// One synthesized video frame for the avatar view
    VideoFrame(VideoFrame),
    /// Microphone telemetry for level meters
    Quality(QualityMetrics),
    /// A barge-in was committed; carries the interrupted turn's index
    Interrupted { turn_index: u64 },
    /// The connection is retrying after a drop
    Reconnecting { attempt: u32 },
    Error {
        message: String,
        recoverable: bool,
    },
}
