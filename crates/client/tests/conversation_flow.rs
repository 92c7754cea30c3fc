//! Conversation protocol tests
//!
//! Full-pipeline tests under a paused clock: mock transport, in-memory
//! microphone and speaker. Every timing property (endpointing, barge-in
//! debounce) is driven with explicit clock advances.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use avatar_voice_audio::{
    AudioCaptureEngine, AudioPlaybackEngine, CaptureConfig, NullInputDevice, NullOutputDevice,
    PlaybackConfig,
};
use avatar_voice_client::{
    ConversationEvent, ConversationOrchestrator, ConversationState, OrchestratorConfig,
};
use avatar_voice_transport::{
    ConnectionConfig, ConnectionSession, DuplexTransport, TransportError, TransportEvent,
};

#[derive(Clone, Default)]
struct MockHandle {
    event_tx: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockHandle {
    async fn inject_json(&self, json: &str) {
        let tx = self.event_tx.lock().clone().expect("transport not wired");
        tx.send(TransportEvent::Message(json.to_string()))
            .await
            .expect("session actor gone");
    }

    fn sent_count(&self, message_type: &str) -> usize {
        let needle = format!(r#""type":"{message_type}""#);
        self.sent
            .lock()
            .iter()
            .filter(|m| m.contains(&needle))
            .count()
    }

    fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

struct MockTransport {
    handle: MockHandle,
    connected: AtomicBool,
}

impl MockTransport {
    fn new() -> (Box<dyn DuplexTransport>, MockHandle) {
        let handle = MockHandle::default();
        let transport = MockTransport {
            handle: handle.clone(),
            connected: AtomicBool::new(false),
        };
        (Box::new(transport), handle)
    }
}

#[async_trait]
impl DuplexTransport for MockTransport {
    async fn connect(&mut self, _url: &str) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.handle.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_event_callback(&mut self, tx: mpsc::Sender<TransportEvent>) {
        *self.handle.event_tx.lock() = Some(tx);
    }
}

const SESSION_CREATED: &str = r#"{"type":"session_created","session_id":"sess-1","user_id":"u-1","is_guest":false,"timestamp":1}"#;
const RESPONSE_START: &str = r#"{"type":"response_start","turn_id":1}"#;
const RESPONSE_AUDIO: &str = r#"{"type":"response_audio","audio_data":"AAAA","sequence_number":0,"timestamp":1,"duration_ms":300}"#;
const RESPONSE_END: &str = r#"{"type":"response_end","metrics":{}}"#;

struct Harness {
    orchestrator: ConversationOrchestrator,
    transport: MockHandle,
    mic: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    speaker: Arc<NullOutputDevice>,
    events: broadcast::Receiver<ConversationEvent>,
}

impl Harness {
    fn new() -> Self {
        let (transport_box, transport) = MockTransport::new();
        let connection = ConnectionSession::new(
            transport_box,
            ConnectionConfig {
                url: "ws://test.invalid/ws".to_string(),
                ..ConnectionConfig::default()
            },
        );

        let input = NullInputDevice::new();
        let mic = input.sender_slot();
        let capture = AudioCaptureEngine::new(Box::new(input), CaptureConfig::default());

        let speaker = NullOutputDevice::new();
        let playback = AudioPlaybackEngine::new(speaker.clone(), PlaybackConfig::default());

        let orchestrator = ConversationOrchestrator::new(
            connection,
            capture,
            playback,
            OrchestratorConfig::default(),
        );
        let events = orchestrator.subscribe();

        Self {
            orchestrator,
            transport,
            mic,
            speaker,
            events,
        }
    }

    async fn connect_and_listen(&self) {
        self.orchestrator.connect().await.unwrap();
        settle().await;
        self.transport.inject_json(SESSION_CREATED).await;
        settle().await;
        assert_eq!(self.orchestrator.state(), ConversationState::Connected);

        self.orchestrator.start_listening().await.unwrap();
        settle().await;
        assert_eq!(self.orchestrator.state(), ConversationState::Listening);
    }

    /// Push one 100ms microphone block
    async fn push(&self, block: Vec<f32>) {
        let tx = self.mic.lock().clone().expect("microphone not open");
        tx.send(block).await.expect("capture worker gone");
        settle().await;
    }

    async fn push_speech(&self) {
        self.push(vec![0.5; 1600]).await;
    }

    async fn push_silence(&self) {
        self.push(vec![0.0; 1600]).await;
    }

    /// Drive the conversation into `Speaking`
    async fn reach_speaking(&self) {
        self.connect_and_listen().await;
        self.push_speech().await;
        self.push_silence().await;
        advance(501).await;
        assert_eq!(self.orchestrator.state(), ConversationState::Processing);
        self.transport.inject_json(RESPONSE_START).await;
        settle().await;
        assert_eq!(self.orchestrator.state(), ConversationState::Speaking);
    }

    fn drain_events(&mut self) -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn end_of_utterance_after_silence_window() {
    let harness = Harness::new();
    harness.connect_and_listen().await;

    harness.push_speech().await;
    harness.push_silence().await; // arms the 500ms silence timer
    advance(501).await;

    assert_eq!(harness.orchestrator.state(), ConversationState::Processing);
    assert_eq!(harness.transport.sent_count("end_utterance"), 1);
}

#[tokio::test(start_paused = true)]
async fn voice_edge_resets_silence_timer() {
    let harness = Harness::new();
    harness.connect_and_listen().await;

    harness.push_speech().await;
    harness.push_silence().await;
    advance(400).await;
    harness.push_speech().await; // cancels the pending timer
    advance(600).await;

    assert_eq!(harness.orchestrator.state(), ConversationState::Listening);
    assert_eq!(harness.transport.sent_count("end_utterance"), 0);
}

#[tokio::test(start_paused = true)]
async fn audio_chunks_stream_only_while_listening() {
    let harness = Harness::new();
    harness.connect_and_listen().await;

    harness.push_speech().await;
    assert_eq!(harness.transport.sent_count("audio_chunk"), 1);

    // Endpoint the utterance; chunks must stop flowing in Processing
    harness.push_silence().await;
    advance(501).await;
    assert_eq!(harness.orchestrator.state(), ConversationState::Processing);

    harness.push_speech().await;
    assert_eq!(harness.transport.sent_count("audio_chunk"), 2);
}

#[tokio::test(start_paused = true)]
async fn brief_noise_during_response_is_debounced() {
    let harness = Harness::new();
    harness.reach_speaking().await;

    harness.push_speech().await; // arms the 200ms confirmation timer
    advance(150).await;
    harness.push_silence().await; // voice dropped before the window closed
    advance(300).await;

    assert_eq!(harness.orchestrator.state(), ConversationState::Speaking);
    assert_eq!(harness.transport.sent_count("interruption"), 0);
    assert_eq!(harness.orchestrator.turn_index(), 0);
}

#[tokio::test(start_paused = true)]
async fn sustained_speech_commits_exactly_one_interruption() {
    let mut harness = Harness::new();
    harness.reach_speaking().await;
    harness.transport.inject_json(RESPONSE_AUDIO).await;
    settle().await;
    harness.drain_events();

    harness.push_speech().await;
    advance(201).await;

    assert_eq!(harness.orchestrator.state(), ConversationState::Listening);
    assert_eq!(harness.transport.sent_count("interruption"), 1);

    // The interruption carries the pre-increment turn index
    let interruption = harness
        .transport
        .sent_messages()
        .into_iter()
        .find(|m| m.contains(r#""type":"interruption""#))
        .unwrap();
    assert!(interruption.contains(r#""turn_index":0"#));
    assert_eq!(harness.orchestrator.turn_index(), 1);

    // Playback was stopped before the queued chunk could finish
    assert!(harness.speaker.played().is_empty());

    let events = harness.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ConversationEvent::Interrupted { turn_index: 0 }))
            .count(),
        1
    );

    // Continued speech after the commit must not re-trigger
    harness.push_silence().await;
    harness.push_speech().await;
    advance(300).await;
    assert_eq!(harness.transport.sent_count("interruption"), 1);
}

#[tokio::test(start_paused = true)]
async fn late_response_audio_after_barge_in_never_plays() {
    let harness = Harness::new();
    harness.reach_speaking().await;

    harness.push_speech().await;
    advance(201).await;
    assert_eq!(harness.orchestrator.state(), ConversationState::Listening);
    assert_eq!(harness.transport.sent_count("interruption"), 1);

    // A straggler chunk of the interrupted response arrives after the commit
    harness.transport.inject_json(RESPONSE_AUDIO).await;
    settle().await;
    advance(301).await;

    assert!(
        harness.speaker.played().is_empty(),
        "interrupted response audio must not play over the new turn"
    );
    assert_eq!(harness.orchestrator.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn barge_in_arms_when_user_already_speaking_at_response_start() {
    let harness = Harness::new();
    harness.connect_and_listen().await;

    harness.push_speech().await;
    harness.push_silence().await;
    advance(501).await;
    assert_eq!(harness.orchestrator.state(), ConversationState::Processing);

    // The user starts again before the response; the active edge lands in
    // Processing, so no fresh edge will arrive once the response starts
    harness.push_speech().await;
    harness.transport.inject_json(RESPONSE_START).await;
    settle().await;
    assert_eq!(harness.orchestrator.state(), ConversationState::Speaking);

    harness.push_speech().await;
    advance(201).await;

    assert_eq!(harness.transport.sent_count("interruption"), 1);
    assert_eq!(harness.orchestrator.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn response_plays_and_returns_to_idle() {
    let harness = Harness::new();
    harness.reach_speaking().await;

    harness.transport.inject_json(RESPONSE_AUDIO).await;
    settle().await;
    advance(301).await; // chunk duration is declared as 300ms
    assert_eq!(harness.speaker.played(), vec![0]);

    harness.transport.inject_json(RESPONSE_END).await;
    settle().await;
    assert_eq!(harness.orchestrator.state(), ConversationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn disconnect_forces_disconnected() {
    let harness = Harness::new();
    harness.connect_and_listen().await;

    harness.orchestrator.disconnect().await.unwrap();
    settle().await;
    assert_eq!(
        harness.orchestrator.state(),
        ConversationState::Disconnected
    );

    // No dangling timer may fire afterward
    advance(5_000).await;
    assert_eq!(harness.transport.sent_count("end_utterance"), 0);
    assert_eq!(
        harness.orchestrator.state(),
        ConversationState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn service_error_surfaces_as_conversation_error() {
    let mut harness = Harness::new();
    harness.connect_and_listen().await;
    harness.drain_events();

    harness
        .transport
        .inject_json(r#"{"type":"error","error_message":"inference failed","recoverable":true}"#)
        .await;
    settle().await;

    assert_eq!(harness.orchestrator.state(), ConversationState::Error);
    assert!(harness.drain_events().iter().any(
        |e| matches!(e, ConversationEvent::Error { recoverable, .. } if *recoverable)
    ));
}
