//! Audio capture engine
//!
//! Turns a continuous microphone stream into fixed-duration encoded chunks
//! with per-chunk quality telemetry and voice-activity edges. The device is
//! injected behind [`AudioInputDevice`]; a worker task owns the metering and
//! chunking so the engine's public surface stays non-blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use avatar_voice_core::{AudioChunk, AudioFormat, QualityMetrics};

use crate::meter::QualityMeter;
use crate::vad::VadDetector;
use crate::AudioError;

/// Recording lifecycle state. Mutated only by the engine and its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Error,
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub format: AudioFormat,
    /// Target chunk cadence
    pub chunk_duration_ms: u64,
    /// RMS level below which a chunk counts as silence
    pub silence_threshold_db: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            chunk_duration_ms: 100,
            silence_threshold_db: -40.0,
        }
    }
}

/// Events published by the capture engine
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    StateChanged {
        old: RecordingState,
        new: RecordingState,
    },
    /// One encoded chunk, emitted at the configured cadence
    Chunk(AudioChunk),
    /// Telemetry for the chunk emitted alongside
    Quality(QualityMetrics),
    /// Voice activity edge (silence to speech or back)
    VoiceActivity { active: bool },
    Error {
        message: String,
        recoverable: bool,
    },
}

/// Microphone abstraction.
///
/// `open` yields a stream of raw sample blocks in `[-1.0, 1.0]`; block sizes
/// are device-determined and carry no chunk alignment.
#[async_trait]
pub trait AudioInputDevice: Send + Sync {
    /// Prompt for microphone access. Resolves with the user's decision.
    async fn request_permission(&mut self) -> Result<bool, AudioError>;

    /// Whether access is already granted, without prompting
    fn permission_granted(&self) -> bool;

    /// Start the hardware stream
    async fn open(&mut self, format: &AudioFormat) -> Result<mpsc::Receiver<Vec<f32>>, AudioError>;

    /// Stop the hardware stream and release the device
    async fn close(&mut self) -> Result<(), AudioError>;
}

const ANY_RECORDING_STATE: &[RecordingState] = &[
    RecordingState::Idle,
    RecordingState::Recording,
    RecordingState::Paused,
    RecordingState::Error,
];

/// Capture engine
pub struct AudioCaptureEngine {
    device: Box<dyn AudioInputDevice>,
    config: CaptureConfig,
    state: Arc<RwLock<RecordingState>>,
    event_tx: broadcast::Sender<CaptureEvent>,
    paused: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AudioCaptureEngine {
    pub fn new(device: Box<dyn AudioInputDevice>, config: CaptureConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            device,
            config,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            event_tx,
            paused: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Subscribe to capture events
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> RecordingState {
        *self.state.read()
    }

    /// Whether microphone access is granted, without prompting
    pub fn permission_granted(&self) -> bool {
        self.device.permission_granted()
    }

    /// Prompt for microphone access
    pub async fn request_permission(&mut self) -> Result<bool, AudioError> {
        self.device.request_permission().await
    }

    /// Start capturing. No-op when already recording; resumes when paused.
    ///
    /// Acquires permission reactively if missing. Denial is a recoverable
    /// error: the engine enters `Error` and the caller decides whether to
    /// re-prompt.
    pub async fn start_recording(&mut self) -> Result<(), AudioError> {
        match self.state() {
            RecordingState::Recording => {
                tracing::debug!("start_recording: already recording");
                return Ok(());
            }
            RecordingState::Paused => {
                self.paused.store(false, Ordering::SeqCst);
                self.transition(&[RecordingState::Paused], RecordingState::Recording);
                return Ok(());
            }
            _ => {}
        }

        if !self.device.permission_granted() {
            let granted = match self.device.request_permission().await {
                Ok(granted) => granted,
                Err(e) => {
                    self.fail(format!("permission request failed: {e}"));
                    return Err(e);
                }
            };
            if !granted {
                self.fail(AudioError::PermissionDenied.to_string());
                return Err(AudioError::PermissionDenied);
            }
        }

        let rx = match self.device.open(&self.config.format).await {
            Ok(rx) => rx,
            Err(e) => {
                self.fail(format!("failed to open capture device: {e}"));
                return Err(e);
            }
        };

        self.paused.store(false, Ordering::SeqCst);
        self.transition(
            &[RecordingState::Idle, RecordingState::Error],
            RecordingState::Recording,
        );
        self.spawn_worker(rx);
        Ok(())
    }

    /// Stop capturing and release the device. No-op when idle.
    pub async fn stop_recording(&mut self) -> Result<(), AudioError> {
        if !matches!(
            self.state(),
            RecordingState::Recording | RecordingState::Paused
        ) {
            tracing::debug!("stop_recording: not recording");
            return Ok(());
        }

        // Abort the worker before closing the device, so stream teardown is
        // never mistaken for a device failure.
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        if let Err(e) = self.device.close().await {
            tracing::warn!("capture device close: {e}");
        }
        self.paused.store(false, Ordering::SeqCst);
        self.transition(ANY_RECORDING_STATE, RecordingState::Idle);
        Ok(())
    }

    /// Suspend chunk emission without releasing the device
    pub fn pause_recording(&mut self) {
        if self.state() != RecordingState::Recording {
            tracing::warn!(state = ?self.state(), "pause_recording ignored");
            return;
        }
        self.paused.store(true, Ordering::SeqCst);
        self.transition(&[RecordingState::Recording], RecordingState::Paused);
    }

    pub fn resume_recording(&mut self) {
        if self.state() != RecordingState::Paused {
            tracing::warn!(state = ?self.state(), "resume_recording ignored");
            return;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.transition(&[RecordingState::Paused], RecordingState::Recording);
    }

    fn spawn_worker(&mut self, mut rx: mpsc::Receiver<Vec<f32>>) {
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let paused = Arc::clone(&self.paused);
        let chunk_duration_ms = self.config.chunk_duration_ms;
        let samples_per_chunk = self.config.format.samples_per_chunk(chunk_duration_ms);
        let threshold_db = self.config.silence_threshold_db;

        self.worker = Some(tokio::spawn(async move {
            let mut meter = QualityMeter::new(threshold_db);
            let mut vad = VadDetector::new();
            let mut pending: Vec<f32> = Vec::with_capacity(samples_per_chunk);
            let mut sequence: u64 = 0;

            while let Some(block) = rx.recv().await {
                if paused.load(Ordering::SeqCst) {
                    pending.clear();
                    continue;
                }
                for sample in block {
                    pending.push(sample);
                    if pending.len() < samples_per_chunk {
                        continue;
                    }

                    let metrics = meter.measure(&pending);
                    let chunk = AudioChunk {
                        sequence_number: sequence,
                        data: encode_pcm16(&pending),
                        timestamp_ms: sequence * chunk_duration_ms,
                    };
                    sequence += 1;
                    pending.clear();

                    let _ = event_tx.send(CaptureEvent::Quality(metrics));
                    if let Some(active) = vad.update(&metrics) {
                        let _ = event_tx.send(CaptureEvent::VoiceActivity { active });
                    }
                    let _ = event_tx.send(CaptureEvent::Chunk(chunk));
                }
            }

            // The device stream ended underneath us. Recoverable: the caller
            // may start a fresh recording.
            let old = *state.read();
            if old == RecordingState::Recording {
                *state.write() = RecordingState::Error;
                let _ = event_tx.send(CaptureEvent::StateChanged {
                    old,
                    new: RecordingState::Error,
                });
                let _ = event_tx.send(CaptureEvent::Error {
                    message: "capture stream ended unexpectedly".to_string(),
                    recoverable: true,
                });
            }
        }));
    }

    fn fail(&mut self, message: String) {
        tracing::warn!("capture error: {message}");
        self.transition(ANY_RECORDING_STATE, RecordingState::Error);
        let _ = self.event_tx.send(CaptureEvent::Error {
            message,
            recoverable: true,
        });
    }

    fn transition(&mut self, allowed: &[RecordingState], to: RecordingState) -> bool {
        let old = *self.state.read();
        if old == to {
            return true;
        }
        if !allowed.contains(&old) {
            tracing::warn!(?old, ?to, "illegal recording transition ignored");
            return false;
        }
        *self.state.write() = to;
        tracing::debug!(?old, new = ?to, "recording state");
        let _ = self
            .event_tx
            .send(CaptureEvent::StateChanged { old, new: to });
        true
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Encode float samples as 16-bit little-endian PCM
fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        data.extend_from_slice(&v.to_le_bytes());
    }
    data
}

/// In-memory input device for tests and headless runs.
///
/// `open` hands the sample sender to a shared slot so a test (or a demo
/// signal generator) can push blocks into the engine.
pub struct NullInputDevice {
    permission: bool,
    sender_slot: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
}

impl NullInputDevice {
    pub fn new() -> Self {
        Self {
            permission: true,
            sender_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// A device whose permission prompt is always denied
    pub fn denied() -> Self {
        Self {
            permission: false,
            sender_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Slot that receives the sample sender when the device opens
    pub fn sender_slot(&self) -> Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>> {
        Arc::clone(&self.sender_slot)
    }
}

impl Default for NullInputDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioInputDevice for NullInputDevice {
    async fn request_permission(&mut self) -> Result<bool, AudioError> {
        Ok(self.permission)
    }

    fn permission_granted(&self) -> bool {
        self.permission
    }

    async fn open(&mut self, _format: &AudioFormat) -> Result<mpsc::Receiver<Vec<f32>>, AudioError> {
        let (tx, rx) = mpsc::channel(64);
        *self.sender_slot.lock() = Some(tx);
        Ok(rx)
    }

    async fn close(&mut self) -> Result<(), AudioError> {
        *self.sender_slot.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut broadcast::Receiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn engine_with_device() -> (AudioCaptureEngine, Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>) {
        let device = NullInputDevice::new();
        let slot = device.sender_slot();
        (
            AudioCaptureEngine::new(Box::new(device), CaptureConfig::default()),
            slot,
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (mut engine, _slot) = engine_with_device();
        let mut rx = engine.subscribe();

        engine.start_recording().await.unwrap();
        engine.start_recording().await.unwrap();
        assert_eq!(engine.state(), RecordingState::Recording);

        let transitions = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CaptureEvent::StateChanged { .. }))
            .count();
        assert_eq!(transitions, 1, "redundant start must not re-fire");
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let (mut engine, _slot) = engine_with_device();
        engine.stop_recording().await.unwrap();
        assert_eq!(engine.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_permission_denied_is_recoverable_error() {
        let mut engine =
            AudioCaptureEngine::new(Box::new(NullInputDevice::denied()), CaptureConfig::default());
        let mut rx = engine.subscribe();

        let err = engine.start_recording().await.unwrap_err();
        assert!(matches!(err, AudioError::PermissionDenied));
        assert_eq!(engine.state(), RecordingState::Error);
        assert!(drain(&mut rx).iter().any(
            |e| matches!(e, CaptureEvent::Error { recoverable, .. } if *recoverable)
        ));
    }

    #[tokio::test]
    async fn test_chunks_carry_monotonic_sequence_and_timestamps() {
        let (mut engine, slot) = engine_with_device();
        let mut rx = engine.subscribe();
        engine.start_recording().await.unwrap();

        let tx = slot.lock().clone().unwrap();
        // Two full 100ms chunks at 16kHz
        tx.send(vec![0.3; 3200]).await.unwrap();
        settle().await;

        let chunks: Vec<AudioChunk> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                CaptureEvent::Chunk(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].sequence_number, 0);
        assert_eq!(chunks[1].sequence_number, 1);
        assert_eq!(chunks[0].timestamp_ms, 0);
        assert_eq!(chunks[1].timestamp_ms, 100);
        // 1600 samples of 16-bit PCM
        assert_eq!(chunks[0].data.len(), 3200);
    }

    #[tokio::test]
    async fn test_vad_edges_on_speech_and_silence() {
        let (mut engine, slot) = engine_with_device();
        let mut rx = engine.subscribe();
        engine.start_recording().await.unwrap();

        let tx = slot.lock().clone().unwrap();
        tx.send(vec![0.5; 1600]).await.unwrap(); // speech
        tx.send(vec![0.5; 1600]).await.unwrap(); // speech, no edge
        tx.send(vec![0.0005; 1600]).await.unwrap(); // silence
        settle().await;

        let edges: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                CaptureEvent::VoiceActivity { active } => Some(active),
                _ => None,
            })
            .collect();
        assert_eq!(edges, vec![true, false]);
    }

    #[tokio::test]
    async fn test_pause_drops_chunks() {
        let (mut engine, slot) = engine_with_device();
        let mut rx = engine.subscribe();
        engine.start_recording().await.unwrap();

        engine.pause_recording();
        assert_eq!(engine.state(), RecordingState::Paused);

        let tx = slot.lock().clone().unwrap();
        tx.send(vec![0.5; 3200]).await.unwrap();
        settle().await;

        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, CaptureEvent::Chunk(_))),
            "no chunks while paused"
        );

        engine.resume_recording();
        assert_eq!(engine.state(), RecordingState::Recording);
    }

    #[tokio::test]
    async fn test_stop_returns_to_idle() {
        let (mut engine, _slot) = engine_with_device();
        engine.start_recording().await.unwrap();
        engine.stop_recording().await.unwrap();
        assert_eq!(engine.state(), RecordingState::Idle);
    }
}
