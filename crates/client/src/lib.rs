//! Avatar Voice Client
//!
//! Composes the connection session, capture engine, and playback engine
//! into the turn-based conversation protocol: listen, endpoint, wait for
//! the response, play it back, and handle barge-in.

pub mod conversation;
pub mod events;

pub use conversation::{ConversationOrchestrator, ConversationState, OrchestratorConfig};
pub use events::ConversationEvent;
