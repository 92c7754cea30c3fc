//! Transport abstraction
//!
//! The connection session talks to the network through this trait so the
//! state machine is testable with an in-memory transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::TransportError;

/// Raw events surfaced by a transport implementation
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The underlying connection is established
    Connected,
    /// One inbound text frame
    Message(String),
    /// The connection dropped or was closed by the peer
    Disconnected { reason: String },
    /// Transport-level failure
    Error { message: String },
}

/// A persistent bidirectional text-frame channel
#[async_trait]
pub trait DuplexTransport: Send + Sync {
    /// Open the connection. Resolves once the transport is usable.
    async fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    /// Send one text frame
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Close the connection and release resources
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the transport is currently connected
    fn is_connected(&self) -> bool;

    /// Register the channel inbound events are delivered on
    fn set_event_callback(&mut self, tx: mpsc::Sender<TransportEvent>);
}
