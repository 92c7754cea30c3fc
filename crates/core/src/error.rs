//! Error taxonomy shared across the client

use thiserror::Error;

/// Top-level error type aggregating the component taxonomies
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Microphone permission denied or revoked
    #[error("permission error: {0}")]
    Permission(String),

    /// Connect failure, transport drop, or handshake timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Decode or buffer underrun during playback
    #[error("playback error: {0}")]
    Playback(String),

    /// Device failure during an active recording
    #[error("capture error: {0}")]
    Capture(String),

    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// Reconnection attempts exhausted; a fresh session is required
    #[error("session abandoned: {0}")]
    SessionAbandoned(String),
}

impl Error {
    /// Whether the caller can retry without tearing down the session.
    ///
    /// Permission, transport, playback, and capture errors are recoverable
    /// by caller action (re-request permission, reconnect, re-enqueue).
    /// Protocol errors are ignored upstream and never surface here as
    /// fatal. Exhausted reconnection is the one non-recoverable case.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Error::SessionAbandoned(_) | Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(Error::Permission("denied".into()).recoverable());
        assert!(Error::Transport("dropped".into()).recoverable());
        assert!(Error::Playback("underrun".into()).recoverable());
        assert!(!Error::SessionAbandoned("5 attempts".into()).recoverable());
    }
}
