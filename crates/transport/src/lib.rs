//! Avatar Voice Transport Layer
//!
//! Owns the persistent duplex channel to the conversation service:
//! - Wire protocol messages (tagged JSON)
//! - Transport abstraction with a WebSocket implementation
//! - [`ConnectionSession`]: connect/authenticate handshake, message
//!   dispatch, and bounded reconnection

pub mod protocol;
pub mod session;
pub mod traits;
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};
pub use session::{ConnectionConfig, ConnectionEvent, ConnectionSession, ConnectionState};
pub use traits::{DuplexTransport, TransportEvent};
pub use websocket::WebSocketTransport;

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication timed out after {0} ms")]
    AuthTimeout(u64),

    #[error("not connected")]
    NotConnected,

    #[error("channel closed")]
    ChannelClosed,

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("internal error: {0}")]
    Internal(String),
}
