//! Conversation orchestrator
//!
//! Single owner of the conversation state machine. Runs as one actor task
//! that selects over the connection, capture, and playback event streams
//! plus its own command channel; every timer decision (end-of-utterance,
//! barge-in confirmation) re-enters through the command channel so state is
//! only ever touched from one place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use avatar_voice_audio::{AudioCaptureEngine, AudioPlaybackEngine, CaptureEvent, PlaybackEvent};
use avatar_voice_core::{Error, Result, TimerSlot};
use avatar_voice_transport::{ClientMessage, ConnectionEvent, ConnectionSession, ServerMessage};

use crate::events::ConversationEvent;

/// Conversation lifecycle state. Mutated only by the orchestrator actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Interrupted,
    Error,
    Disconnected,
}

/// Turn-taking configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Silence required in `Listening` before the utterance ends
    pub end_of_utterance_silence: Duration,
    /// Sustained voice activity required in `Speaking` to commit a barge-in
    pub barge_in_confirmation: Duration,
    /// Allow interrupting an in-flight response
    pub barge_in_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            end_of_utterance_silence: Duration::from_millis(500),
            barge_in_confirmation: Duration::from_millis(200),
            barge_in_enabled: true,
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    StartListening,
    StopListening,
    SilenceElapsed(u64),
    BargeInConfirmed(u64),
}

const ANY_CONVERSATION_STATE: &[ConversationState] = &[
    ConversationState::Idle,
    ConversationState::Connecting,
    ConversationState::Connected,
    ConversationState::Listening,
    ConversationState::Processing,
    ConversationState::Speaking,
    ConversationState::Interrupted,
    ConversationState::Error,
    ConversationState::Disconnected,
];

/// Handle to the conversation actor.
///
/// The three engines are injected at construction; the orchestrator owns
/// them for the lifetime of the conversation.
pub struct ConversationOrchestrator {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<ConversationEvent>,
    state: Arc<RwLock<ConversationState>>,
    turn_index: Arc<AtomicU64>,
    actor: JoinHandle<()>,
}

impl ConversationOrchestrator {
    pub fn new(
        connection: ConnectionSession,
        capture: AudioCaptureEngine,
        playback: AudioPlaybackEngine,
        config: OrchestratorConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let state = Arc::new(RwLock::new(ConversationState::Idle));
        let turn_index = Arc::new(AtomicU64::new(0));

        let connection_rx = connection.subscribe();
        let capture_rx = capture.subscribe();
        let playback_rx = playback.subscribe();

        let actor = OrchestratorActor {
            config,
            connection,
            capture,
            playback,
            connection_rx,
            capture_rx,
            playback_rx,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            state: Arc::clone(&state),
            turn_index: Arc::clone(&turn_index),
            event_tx: event_tx.clone(),
            silence_timer: TimerSlot::new(),
            barge_in_timer: TimerSlot::new(),
            voice_active: false,
        };

        let actor = tokio::spawn(actor.run());

        Self {
            cmd_tx,
            event_tx,
            state,
            turn_index,
            actor,
        }
    }

    /// Open the connection and authenticate
    pub async fn connect(&self) -> Result<()> {
        self.send_command(Command::Connect).await
    }

    /// Tear everything down: capture, playback, connection
    pub async fn disconnect(&self) -> Result<()> {
        self.send_command(Command::Disconnect).await
    }

    /// Begin a listening turn: start the microphone and stream chunks
    pub async fn start_listening(&self) -> Result<()> {
        self.send_command(Command::StartListening).await
    }

    /// End the listening turn without sending an end-of-utterance
    pub async fn stop_listening(&self) -> Result<()> {
        self.send_command(Command::StopListening).await
    }

    /// Subscribe to conversation events
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> ConversationState {
        *self.state.read()
    }

    /// Current turn index; incremented on each committed interruption
    pub fn turn_index(&self) -> u64 {
        self.turn_index.load(Ordering::SeqCst)
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Transport("conversation task stopped".to_string()))
    }
}

impl Drop for ConversationOrchestrator {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

struct OrchestratorActor {
    config: OrchestratorConfig,
    connection: ConnectionSession,
    capture: AudioCaptureEngine,
    playback: AudioPlaybackEngine,
    connection_rx: broadcast::Receiver<ConnectionEvent>,
    capture_rx: broadcast::Receiver<CaptureEvent>,
    playback_rx: broadcast::Receiver<PlaybackEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    state: Arc<RwLock<ConversationState>>,
    turn_index: Arc<AtomicU64>,
    event_tx: broadcast::Sender<ConversationEvent>,
    silence_timer: TimerSlot,
    barge_in_timer: TimerSlot,
    /// Last VAD level seen, not just the edge
    voice_active: bool,
}

impl OrchestratorActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = self.connection_rx.recv() => match event {
                    Ok(event) => self.handle_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "lagged on connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = self.capture_rx.recv() => match event {
                    Ok(event) => self.handle_capture_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "lagged on capture events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = self.playback_rx.recv() => match event {
                    Ok(event) => self.handle_playback_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "lagged on playback events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("conversation actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                let current = *self.state.read();
                if !matches!(
                    current,
                    ConversationState::Idle
                        | ConversationState::Disconnected
                        | ConversationState::Error
                ) {
                    tracing::warn!(?current, "connect() ignored in this state");
                    return;
                }
                self.transition(
                    &[
                        ConversationState::Idle,
                        ConversationState::Disconnected,
                        ConversationState::Error,
                    ],
                    ConversationState::Connecting,
                );
                if let Err(e) = self.connection.connect().await {
                    self.fail(format!("connect failed: {e}"), true);
                }
            }
            Command::Disconnect => {
                self.silence_timer.cancel();
                self.barge_in_timer.cancel();
                if let Err(e) = self.capture.stop_recording().await {
                    tracing::warn!("capture teardown: {e}");
                }
                self.voice_active = false;
                self.playback.stop();
                if let Err(e) = self.connection.disconnect().await {
                    tracing::warn!("connection teardown: {e}");
                }
                self.transition(ANY_CONVERSATION_STATE, ConversationState::Disconnected);
            }
            Command::StartListening => {
                let current = *self.state.read();
                if !matches!(
                    current,
                    ConversationState::Connected | ConversationState::Idle
                ) {
                    tracing::warn!(?current, "start_listening ignored in this state");
                    return;
                }
                self.begin_listening().await;
            }
            Command::StopListening => {
                if *self.state.read() != ConversationState::Listening {
                    tracing::debug!("stop_listening: not listening");
                    return;
                }
                self.silence_timer.cancel();
                if let Err(e) = self.capture.stop_recording().await {
                    tracing::warn!("capture stop: {e}");
                }
                self.voice_active = false;
                self.transition(&[ConversationState::Listening], ConversationState::Idle);
            }
            Command::SilenceElapsed(generation) => {
                if generation != self.silence_timer.generation() {
                    return;
                }
                if *self.state.read() != ConversationState::Listening {
                    return;
                }
                self.end_utterance().await;
            }
            Command::BargeInConfirmed(generation) => {
                if generation != self.barge_in_timer.generation() {
                    return;
                }
                if *self.state.read() != ConversationState::Speaking {
                    return;
                }
                self.commit_barge_in().await;
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::SessionCreated { session_id, .. } => {
                // Also reached after a successful reconnect, from Error
                self.transition(
                    &[
                        ConversationState::Connecting,
                        ConversationState::Error,
                    ],
                    ConversationState::Connected,
                );
                let _ = self
                    .event_tx
                    .send(ConversationEvent::SessionReady { session_id });
            }
            ConnectionEvent::Message(message) => self.handle_server_message(message).await,
            ConnectionEvent::Reconnecting { attempt } => {
                let _ = self
                    .event_tx
                    .send(ConversationEvent::Reconnecting { attempt });
            }
            ConnectionEvent::Error {
                message,
                recoverable,
            } => {
                self.fail(message, recoverable);
            }
            ConnectionEvent::StateChanged { .. } => {}
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Transcript {
                transcript,
                is_final,
                confidence,
            } => {
                let _ = self.event_tx.send(ConversationEvent::Transcript {
                    transcript,
                    is_final,
                    confidence,
                });
            }
            ServerMessage::ResponseStart { turn_id } => {
                self.transition(
                    &[ConversationState::Processing],
                    ConversationState::Speaking,
                );
                // The user may already be mid-speech when the response
                // starts; no fresh edge will arrive, so arm from the level.
                if self.config.barge_in_enabled && self.voice_active {
                    self.arm_barge_in_timer();
                }
                let _ = self
                    .event_tx
                    .send(ConversationEvent::ResponseStarted { turn_id });
            }
            ServerMessage::ResponseAudio {
                audio_data,
                sequence_number,
                timestamp,
                duration_ms,
            } => {
                // Chunks of an interrupted response can still be in flight
                // after the barge-in committed; they must not re-buffer over
                // the user's new turn.
                if *self.state.read() != ConversationState::Speaking {
                    tracing::debug!(sequence_number, "dropping late response audio");
                    return;
                }
                match ServerMessage::decode_audio(
                    &audio_data,
                    sequence_number,
                    timestamp,
                    duration_ms,
                ) {
                    Ok(chunk) => self.playback.add_chunk(chunk),
                    Err(e) => tracing::warn!("dropping undecodable audio chunk: {e}"),
                }
            }
            ServerMessage::ResponseVideo {
                frame_data,
                sequence_number,
                format,
            } => match ServerMessage::decode_video(&frame_data, sequence_number, format) {
                Ok(frame) => {
                    let _ = self.event_tx.send(ConversationEvent::VideoFrame(frame));
                }
                Err(e) => tracing::warn!("dropping undecodable video frame: {e}"),
            },
            ServerMessage::ResponseEnd { .. } => {
                self.barge_in_timer.cancel();
                // Queued audio keeps draining; the turn is over for the
                // protocol's purposes.
                self.transition(&[ConversationState::Speaking], ConversationState::Idle);
                let _ = self.event_tx.send(ConversationEvent::ResponseEnded);
            }
            ServerMessage::Error {
                error_message,
                recoverable,
            } => {
                self.fail(error_message, recoverable);
            }
            ServerMessage::SessionCreated { .. } | ServerMessage::AuthError { .. } => {
                // Handshake traffic is consumed by the connection session
            }
        }
    }

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(chunk) => {
                if *self.state.read() != ConversationState::Listening {
                    return;
                }
                let Some(session_id) = self.connection.session_id() else {
                    tracing::warn!("dropping chunk, no session");
                    return;
                };
                let message = ClientMessage::audio_chunk(&session_id, &chunk);
                if let Err(e) = self.connection.send(message).await {
                    tracing::warn!(
                        sequence_number = chunk.sequence_number,
                        "dropping chunk: {e}"
                    );
                }
            }
            CaptureEvent::Quality(metrics) => {
                let _ = self.event_tx.send(ConversationEvent::Quality(metrics));
            }
            CaptureEvent::VoiceActivity { active } => self.handle_voice_activity(active),
            CaptureEvent::Error {
                message,
                recoverable,
            } => {
                self.fail(message, recoverable);
            }
            CaptureEvent::StateChanged { .. } => {}
        }
    }

    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        if let PlaybackEvent::Error {
            message,
            recoverable,
        } = event
        {
            self.fail(message, recoverable);
        }
    }

    /// Endpointing and barge-in both key off VAD edges; which timer an edge
    /// drives depends on the current state. The level is tracked across
    /// states so entering `Speaking` mid-utterance still arms the barge-in
    /// window.
    fn handle_voice_activity(&mut self, active: bool) {
        self.voice_active = active;
        let state = *self.state.read();
        match state {
            ConversationState::Listening => {
                if active {
                    self.silence_timer.cancel();
                } else {
                    let cmd_tx = self.cmd_tx.clone();
                    self.silence_timer
                        .arm(self.config.end_of_utterance_silence, move |generation| {
                            let _ = cmd_tx.try_send(Command::SilenceElapsed(generation));
                        });
                }
            }
            ConversationState::Speaking if self.config.barge_in_enabled => {
                if active {
                    self.arm_barge_in_timer();
                } else {
                    // Brief noise, not a barge-in
                    self.barge_in_timer.cancel();
                }
            }
            _ => {}
        }
    }

    fn arm_barge_in_timer(&mut self) {
        let cmd_tx = self.cmd_tx.clone();
        self.barge_in_timer
            .arm(self.config.barge_in_confirmation, move |generation| {
                let _ = cmd_tx.try_send(Command::BargeInConfirmed(generation));
            });
    }

    async fn begin_listening(&mut self) {
        if let Err(e) = self.capture.start_recording().await {
            self.fail(format!("failed to start capture: {e}"), true);
            return;
        }
        self.transition(
            &[
                ConversationState::Connected,
                ConversationState::Idle,
                ConversationState::Interrupted,
            ],
            ConversationState::Listening,
        );
    }

    /// The user stopped speaking for the full silence window
    async fn end_utterance(&mut self) {
        self.silence_timer.cancel();
        let Some(session_id) = self.connection.session_id() else {
            tracing::warn!("end of utterance with no session");
            return;
        };
        let message = ClientMessage::end_utterance(&session_id);
        if let Err(e) = self.connection.send(message).await {
            self.fail(format!("failed to send end_utterance: {e}"), true);
            return;
        }
        tracing::info!("utterance ended, awaiting response");
        self.transition(
            &[ConversationState::Listening],
            ConversationState::Processing,
        );
        // Capture stays live: the microphone keeps feeding VAD for the
        // barge-in window of the upcoming response.
    }

    /// Sustained voice activity during a response: stop playback and hand
    /// the floor back to the user.
    async fn commit_barge_in(&mut self) {
        self.barge_in_timer.cancel();

        let interrupted_turn = self.turn_index.load(Ordering::SeqCst);
        if let Some(session_id) = self.connection.session_id() {
            let message = ClientMessage::interruption(&session_id, interrupted_turn);
            if let Err(e) = self.connection.send(message).await {
                tracing::warn!("failed to send interruption: {e}");
            }
        }

        // Queue clearing is synchronous: nothing queued before this point
        // may play after it.
        self.playback.stop();
        self.turn_index.fetch_add(1, Ordering::SeqCst);

        tracing::info!(turn_index = interrupted_turn, "barge-in committed");
        self.transition(&[ConversationState::Speaking], ConversationState::Interrupted);
        let _ = self.event_tx.send(ConversationEvent::Interrupted {
            turn_index: interrupted_turn,
        });
        self.transition(
            &[ConversationState::Interrupted],
            ConversationState::Listening,
        );
    }

    fn fail(&mut self, message: String, recoverable: bool) {
        tracing::warn!(recoverable, "conversation error: {message}");
        self.silence_timer.cancel();
        self.barge_in_timer.cancel();
        self.transition(ANY_CONVERSATION_STATE, ConversationState::Error);
        let _ = self.event_tx.send(ConversationEvent::Error {
            message,
            recoverable,
        });
    }

    fn transition(&mut self, allowed: &[ConversationState], to: ConversationState) -> bool {
        let old = *self.state.read();
        if old == to {
            return true;
        }
        if !allowed.contains(&old) {
            tracing::warn!(?old, ?to, "illegal conversation transition ignored");
            return false;
        }
        *self.state.write() = to;
        tracing::debug!(?old, new = ?to, "conversation state");
        let _ = self
            .event_tx
            .send(ConversationEvent::StateChanged { old, new: to });
        true
    }
}
