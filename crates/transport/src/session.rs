//! Connection session
//!
//! Owns exactly one logical duplex channel: the connect/authenticate
//! handshake, inbound message dispatch, and the bounded reconnection policy.
//! The session runs as a single actor task; callers interact through
//! commands and subscribe to a broadcast event stream, so no shared state
//! is mutated from two places.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use avatar_voice_core::{now_ms, TimerSlot};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::traits::{DuplexTransport, TransportEvent};
use crate::TransportError;

/// Connection lifecycle state. Mutated only by the session actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Error,
    Disconnected,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service endpoint
    pub url: String,
    /// Bearer token sent in the handshake; `None` requests a guest session
    pub auth_token: Option<String>,
    /// Handshake deadline after the transport connects
    pub auth_timeout: Duration,
    /// Attempt reconnection after transport drops and handshake failures
    pub reconnect_enabled: bool,
    /// Bound on consecutive reconnection attempts
    pub max_reconnect_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub reconnect_initial_delay: Duration,
    /// Backoff ceiling
    pub reconnect_max_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:8080/ws/conversation".to_string(),
            auth_token: None,
            auth_timeout: Duration::from_millis(10_000),
            reconnect_enabled: true,
            max_reconnect_attempts: 5,
            reconnect_initial_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Events published by the session
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// Handshake completed
    SessionCreated {
        session_id: String,
        user_id: String,
        is_guest: bool,
    },
    /// Any post-handshake inbound message
    Message(ServerMessage),
    /// A reconnection attempt has been scheduled
    Reconnecting { attempt: u32 },
    Error {
        message: String,
        recoverable: bool,
    },
}

enum Command {
    Connect,
    Disconnect,
    Send(ClientMessage),
    AuthTimeout(u64),
    ReconnectDue(u64),
}

/// Handle to the connection session actor
pub struct ConnectionSession {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    state: Arc<RwLock<ConnectionState>>,
    session_id: Arc<RwLock<Option<String>>>,
    actor: JoinHandle<()>,
}

impl ConnectionSession {
    /// Create a session over the given transport and spawn its actor.
    ///
    /// The transport is injected rather than constructed here so tests can
    /// drive the state machine with an in-memory channel.
    pub fn new(mut transport: Box<dyn DuplexTransport>, config: ConnectionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (transport_tx, transport_rx) = mpsc::channel(256);

        transport.set_event_callback(transport_tx);

        let state = Arc::new(RwLock::new(ConnectionState::Idle));
        let session_id = Arc::new(RwLock::new(None));

        let actor = SessionActor {
            config,
            transport,
            state: Arc::clone(&state),
            session_id: Arc::clone(&session_id),
            event_tx: event_tx.clone(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            transport_rx,
            auth_timer: TimerSlot::new(),
            reconnect_timer: TimerSlot::new(),
            reconnect_attempt: 0,
        };

        let actor = tokio::spawn(actor.run());

        Self {
            cmd_tx,
            event_tx,
            state,
            session_id,
            actor,
        }
    }

    /// Begin the connect/authenticate handshake
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Connect)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Force `Disconnected` from any state; cancels all pending timers
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Disconnect)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Send a message over the channel. Fails fast when not connected.
    pub async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if *self.state.read() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.cmd_tx
            .send(Command::Send(message))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Session id assigned by the service, if authenticated
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

/// States from which `connect()` may start a fresh handshake
const CONNECTABLE: &[ConnectionState] = &[
    ConnectionState::Idle,
    ConnectionState::Disconnected,
    ConnectionState::Error,
    ConnectionState::Reconnecting,
];

const ANY_STATE: &[ConnectionState] = &[
    ConnectionState::Idle,
    ConnectionState::Connecting,
    ConnectionState::Authenticating,
    ConnectionState::Connected,
    ConnectionState::Reconnecting,
    ConnectionState::Error,
    ConnectionState::Disconnected,
];

struct SessionActor {
    config: ConnectionConfig,
    transport: Box<dyn DuplexTransport>,
    state: Arc<RwLock<ConnectionState>>,
    session_id: Arc<RwLock<Option<String>>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    auth_timer: TimerSlot,
    reconnect_timer: TimerSlot,
    reconnect_attempt: u32,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
                else => break,
            }
        }
        tracing::debug!("connection session actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                let current = *self.state.read();
                if !CONNECTABLE.contains(&current) {
                    tracing::warn!(?current, "connect() ignored in this state");
                    return;
                }
                self.reconnect_timer.cancel();
                self.reconnect_attempt = 0;
                self.try_connect().await;
            }
            Command::Disconnect => {
                self.auth_timer.cancel();
                self.reconnect_timer.cancel();
                if let Err(e) = self.transport.close().await {
                    tracing::debug!("transport close: {e}");
                }
                *self.session_id.write() = None;
                self.transition(ANY_STATE, ConnectionState::Disconnected);
            }
            Command::Send(message) => {
                if *self.state.read() != ConnectionState::Connected {
                    tracing::warn!("dropping outbound message, not connected");
                    return;
                }
                self.send_message(message).await;
            }
            Command::AuthTimeout(generation) => {
                // A stale expiry (superseded or already resolved handshake)
                // must be a no-op, not a correctness hazard.
                if generation != self.auth_timer.generation() {
                    return;
                }
                if *self.state.read() != ConnectionState::Authenticating {
                    return;
                }
                self.auth_timer.cancel();
                tracing::warn!(
                    timeout_ms = self.config.auth_timeout.as_millis() as u64,
                    "authentication timed out"
                );
                self.emit_error(
                    TransportError::AuthTimeout(self.config.auth_timeout.as_millis() as u64)
                        .to_string(),
                    true,
                );
                self.transition(&[ConnectionState::Authenticating], ConnectionState::Error);
                self.schedule_reconnect();
            }
            Command::ReconnectDue(generation) => {
                if generation != self.reconnect_timer.generation() {
                    return;
                }
                if *self.state.read() != ConnectionState::Reconnecting {
                    return;
                }
                tracing::info!(attempt = self.reconnect_attempt, "reconnecting");
                self.try_connect().await;
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                tracing::debug!("transport connected");
            }
            TransportEvent::Message(text) => match ServerMessage::from_json(&text) {
                Ok(message) => self.dispatch_message(message),
                Err(e) => {
                    // Protocol taxonomy: log and drop, never crash the
                    // state machine.
                    tracing::warn!("ignoring malformed message: {e}");
                }
            },
            TransportEvent::Disconnected { reason } => {
                let current = *self.state.read();
                if matches!(
                    current,
                    ConnectionState::Disconnected | ConnectionState::Reconnecting
                ) {
                    return;
                }
                self.auth_timer.cancel();
                *self.session_id.write() = None;
                tracing::warn!(%reason, "transport dropped");
                self.emit_error(format!("transport dropped: {reason}"), true);
                // A drop enters the reconnect policy directly; Error is
                // reserved for handshake failures.
                self.schedule_reconnect();
            }
            TransportEvent::Error { message } => {
                self.emit_error(message, true);
            }
        }
    }

    fn dispatch_message(&mut self, message: ServerMessage) {
        let current = *self.state.read();
        match message {
            ServerMessage::SessionCreated {
                session_id,
                user_id,
                is_guest,
                ..
            } => {
                if current != ConnectionState::Authenticating {
                    tracing::warn!(?current, "unexpected session_created, ignoring");
                    return;
                }
                self.auth_timer.cancel();
                self.reconnect_attempt = 0;
                *self.session_id.write() = Some(session_id.clone());
                self.transition(
                    &[ConnectionState::Authenticating],
                    ConnectionState::Connected,
                );
                let _ = self.event_tx.send(ConnectionEvent::SessionCreated {
                    session_id,
                    user_id,
                    is_guest,
                });
            }
            ServerMessage::AuthError { code, message, .. } => {
                if current != ConnectionState::Authenticating {
                    tracing::warn!(?current, "unexpected auth_error, ignoring");
                    return;
                }
                self.auth_timer.cancel();
                tracing::warn!(%code, "authentication rejected: {message}");
                self.emit_error(format!("authentication rejected ({code}): {message}"), true);
                self.transition(&[ConnectionState::Authenticating], ConnectionState::Error);
                self.schedule_reconnect();
            }
            other => {
                if current == ConnectionState::Connected {
                    let _ = self.event_tx.send(ConnectionEvent::Message(other));
                } else {
                    tracing::debug!(?current, "dropping inbound message outside Connected");
                }
            }
        }
    }

    /// One connect + authenticate attempt from the current state
    async fn try_connect(&mut self) {
        self.transition(CONNECTABLE, ConnectionState::Connecting);

        match self.transport.connect(&self.config.url).await {
            Ok(()) => {
                self.transition(&[ConnectionState::Connecting], ConnectionState::Authenticating);
                let auth = ClientMessage::Authenticate {
                    token: self.config.auth_token.clone(),
                    timestamp: now_ms(),
                };
                self.send_message(auth).await;

                // Single handshake deadline; cancelled on every exit path
                // from Authenticating (success, auth error, disconnect).
                let cmd_tx = self.cmd_tx.clone();
                self.auth_timer.arm(self.config.auth_timeout, move |generation| {
                    let _ = cmd_tx.try_send(Command::AuthTimeout(generation));
                });
            }
            Err(e) => {
                tracing::warn!("connect failed: {e}");
                self.emit_error(e.to_string(), true);
                self.transition(&[ConnectionState::Connecting], ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn send_message(&mut self, message: ClientMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to encode outbound message: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send(json).await {
            tracing::warn!("send failed: {e}");
            self.emit_error(e.to_string(), true);
        }
    }

    /// Enter `Reconnecting` and arm the backoff timer, or give up when the
    /// policy is disabled or exhausted.
    fn schedule_reconnect(&mut self) {
        if !self.config.reconnect_enabled {
            self.transition(ANY_STATE, ConnectionState::Disconnected);
            return;
        }
        if self.reconnect_attempt >= self.config.max_reconnect_attempts {
            tracing::error!(
                attempts = self.reconnect_attempt,
                "reconnection attempts exhausted, abandoning session"
            );
            self.emit_error(
                format!(
                    "reconnection attempts exhausted after {} tries",
                    self.reconnect_attempt
                ),
                false,
            );
            self.transition(ANY_STATE, ConnectionState::Disconnected);
            return;
        }

        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = self
            .config
            .reconnect_initial_delay
            .saturating_mul(1 << exponent)
            .min(self.config.reconnect_max_delay);

        self.transition(ANY_STATE, ConnectionState::Reconnecting);
        let _ = self.event_tx.send(ConnectionEvent::Reconnecting { attempt });
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let cmd_tx = self.cmd_tx.clone();
        self.reconnect_timer.arm(delay, move |generation| {
            let _ = cmd_tx.try_send(Command::ReconnectDue(generation));
        });
    }

    /// Guarded state transition: refuses moves from states not in `allowed`.
    fn transition(&mut self, allowed: &[ConnectionState], to: ConnectionState) -> bool {
        let old = *self.state.read();
        if old == to {
            return true;
        }
        if !allowed.contains(&old) {
            tracing::warn!(?old, ?to, "illegal connection transition ignored");
            return false;
        }
        *self.state.write() = to;
        tracing::debug!(?old, new = ?to, "connection state");
        let _ = self
            .event_tx
            .send(ConnectionEvent::StateChanged { old, new: to });
        true
    }

    fn emit_error(&self, message: String, recoverable: bool) {
        let _ = self.event_tx.send(ConnectionEvent::Error {
            message,
            recoverable,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.auth_timeout, Duration::from_millis(10_000));
        assert_eq!(config.reconnect_initial_delay, Duration::from_millis(1_000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.reconnect_enabled);
    }
}
