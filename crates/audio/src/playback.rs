//! Audio playback engine
//!
//! Accepts inbound synthesized chunks in arrival order, gates playback start
//! behind a minimum buffered duration, and drains one chunk at a time to the
//! output device. Delivery order is assumed monotonic from the service; the
//! engine never reorders.
//!
//! `stop()` is synchronous: by the time it returns the queue is empty and no
//! chunk enqueued before the stop can play afterward. Barge-in depends on
//! this.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use avatar_voice_core::{AudioFormat, InboundAudioChunk};

use crate::AudioError;

/// Playback lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Error,
}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub format: AudioFormat,
    /// Buffered duration required before playback starts
    pub buffer_target_ms: u64,
    pub initial_volume: f32,
    pub initial_speed: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            buffer_target_ms: 300,
            initial_volume: 1.0,
            initial_speed: 1.0,
        }
    }
}

/// Events published by the playback engine
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    StateChanged {
        old: PlaybackState,
        new: PlaybackState,
    },
    ChunkPlayed { sequence_number: u64 },
    /// The queue ran dry and playback returned to `Idle`
    QueueDrained,
    Error {
        message: String,
        recoverable: bool,
    },
}

/// Render parameters applied to one chunk
#[derive(Debug, Clone, Copy)]
pub struct PlaybackParams {
    pub volume: f32,
    pub muted: bool,
    pub speed: f32,
    /// Wall-clock duration of the chunk at 1.0x speed
    pub duration: Duration,
}

/// Speaker abstraction. `play` resolves when the chunk finishes rendering.
#[async_trait]
pub trait AudioOutputDevice: Send + Sync {
    async fn play(&self, chunk: &InboundAudioChunk, params: PlaybackParams)
        -> Result<(), AudioError>;
}

const ANY_PLAYBACK_STATE: &[PlaybackState] = &[
    PlaybackState::Idle,
    PlaybackState::Buffering,
    PlaybackState::Playing,
    PlaybackState::Paused,
    PlaybackState::Stopped,
    PlaybackState::Error,
];

struct Shared {
    device: Arc<dyn AudioOutputDevice>,
    format: AudioFormat,
    state: RwLock<PlaybackState>,
    queue: Mutex<VecDeque<InboundAudioChunk>>,
    buffered_ms: Mutex<f64>,
    volume: Mutex<f32>,
    speed: Mutex<f32>,
    muted: AtomicBool,
    event_tx: broadcast::Sender<PlaybackEvent>,
    resume: Notify,
    handling_error: AtomicBool,
}

impl Shared {
    /// Declared duration wins; the byte-size estimate is a PCM-only fallback
    fn chunk_duration_ms(&self, chunk: &InboundAudioChunk) -> f64 {
        match chunk.duration_ms {
            Some(ms) => ms as f64,
            None => self.format.estimate_duration_ms(chunk.data.len()),
        }
    }

    fn transition(&self, allowed: &[PlaybackState], to: PlaybackState) -> bool {
        let old = *self.state.read();
        if old == to {
            return true;
        }
        if !allowed.contains(&old) {
            tracing::warn!(?old, ?to, "illegal playback transition ignored");
            return false;
        }
        *self.state.write() = to;
        tracing::debug!(?old, new = ?to, "playback state");
        let _ = self
            .event_tx
            .send(PlaybackEvent::StateChanged { old, new: to });
        true
    }

    /// Recoverable reset: clear everything and return to `Stopped`, ready
    /// for new chunks. Guarded against re-entry so a failure during
    /// recovery cannot loop.
    fn handle_error(&self, message: String) {
        if self.handling_error.swap(true, Ordering::SeqCst) {
            tracing::error!("error while already recovering: {message}");
            return;
        }
        tracing::warn!("playback error: {message}");
        self.queue.lock().clear();
        *self.buffered_ms.lock() = 0.0;
        self.transition(ANY_PLAYBACK_STATE, PlaybackState::Stopped);
        let _ = self.event_tx.send(PlaybackEvent::Error {
            message,
            recoverable: true,
        });
        self.handling_error.store(false, Ordering::SeqCst);
    }
}

/// Playback engine
pub struct AudioPlaybackEngine {
    shared: Arc<Shared>,
    buffer_target_ms: u64,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    resume_after_background: AtomicBool,
}

impl AudioPlaybackEngine {
    pub fn new(device: Arc<dyn AudioOutputDevice>, config: PlaybackConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                device,
                format: config.format,
                state: RwLock::new(PlaybackState::Idle),
                queue: Mutex::new(VecDeque::new()),
                buffered_ms: Mutex::new(0.0),
                volume: Mutex::new(config.initial_volume.clamp(0.0, 1.0)),
                speed: Mutex::new(config.initial_speed.clamp(0.5, 2.0)),
                muted: AtomicBool::new(false),
                event_tx,
                resume: Notify::new(),
                handling_error: AtomicBool::new(false),
            }),
            buffer_target_ms: config.buffer_target_ms,
            drain_task: Mutex::new(None),
            resume_after_background: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.read()
    }

    pub fn queue_length(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Estimated queued duration in milliseconds
    pub fn buffered_ms(&self) -> u64 {
        self.shared.buffered_ms.lock().round() as u64
    }

    /// Enqueue one inbound chunk; starts playback once the buffer target is
    /// reached.
    pub fn add_chunk(&self, chunk: InboundAudioChunk) {
        let duration = self.shared.chunk_duration_ms(&chunk);
        let buffered = {
            self.shared.queue.lock().push_back(chunk);
            let mut buffered = self.shared.buffered_ms.lock();
            *buffered += duration;
            *buffered
        };

        match self.state() {
            PlaybackState::Idle | PlaybackState::Stopped | PlaybackState::Error => {
                self.shared.transition(
                    &[
                        PlaybackState::Idle,
                        PlaybackState::Stopped,
                        PlaybackState::Error,
                    ],
                    PlaybackState::Buffering,
                );
            }
            _ => {}
        }

        if self.state() == PlaybackState::Buffering && buffered >= self.buffer_target_ms as f64 {
            self.shared
                .transition(&[PlaybackState::Buffering], PlaybackState::Playing);
            self.spawn_drain();
        }
    }

    /// Halt playback and discard everything queued. Unconditional, and used
    /// for interruption, so it completes synchronously.
    pub fn stop(&self) {
        if let Some(task) = self.drain_task.lock().take() {
            task.abort();
        }
        self.shared.queue.lock().clear();
        *self.shared.buffered_ms.lock() = 0.0;
        self.shared
            .transition(ANY_PLAYBACK_STATE, PlaybackState::Stopped);
    }

    /// Valid only while `Playing`; otherwise a warned no-op
    pub fn pause(&self) {
        if self.state() != PlaybackState::Playing {
            tracing::warn!(state = ?self.state(), "pause ignored");
            return;
        }
        self.shared
            .transition(&[PlaybackState::Playing], PlaybackState::Paused);
    }

    /// Valid only while `Paused`; otherwise a warned no-op
    pub fn resume(&self) {
        if self.state() != PlaybackState::Paused {
            tracing::warn!(state = ?self.state(), "resume ignored");
            return;
        }
        self.shared
            .transition(&[PlaybackState::Paused], PlaybackState::Playing);
        self.shared.resume.notify_one();
    }

    /// App moved to background: pause and remember whether to resume
    pub fn handle_background_begin(&self) {
        let playing = self.state() == PlaybackState::Playing;
        self.resume_after_background
            .store(playing, Ordering::SeqCst);
        if playing {
            self.pause();
        }
    }

    /// App returned to foreground: resume if backgrounding paused us
    pub fn handle_background_end(&self) {
        if self.resume_after_background.swap(false, Ordering::SeqCst) {
            self.resume();
        }
    }

    /// Clamped to `0.0..=1.0`, never fails
    pub fn set_volume(&self, volume: f32) {
        *self.shared.volume.lock() = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        *self.shared.volume.lock()
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    /// Clamped to `0.5..=2.0`, never fails
    pub fn set_playback_speed(&self, speed: f32) {
        *self.shared.speed.lock() = speed.clamp(0.5, 2.0);
    }

    pub fn playback_speed(&self) -> f32 {
        *self.shared.speed.lock()
    }

    fn spawn_drain(&self) {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                while *shared.state.read() == PlaybackState::Paused {
                    shared.resume.notified().await;
                }

                let next = shared.queue.lock().pop_front();
                let Some(chunk) = next else {
                    // Hold the queue lock while closing out, so a chunk
                    // enqueued behind the empty pop is either seen here or
                    // arrives after the state is already Idle.
                    let queue = shared.queue.lock();
                    if !queue.is_empty() {
                        continue;
                    }
                    if *shared.state.read() == PlaybackState::Paused {
                        // A pause landed behind the empty pop; go back to
                        // the resume wait instead of exiting, or a later
                        // resume would have no drain task.
                        drop(queue);
                        continue;
                    }
                    shared.transition(&[PlaybackState::Playing], PlaybackState::Idle);
                    let _ = shared.event_tx.send(PlaybackEvent::QueueDrained);
                    break;
                };

                let duration_ms = shared.chunk_duration_ms(&chunk);
                let params = PlaybackParams {
                    volume: *shared.volume.lock(),
                    muted: shared.muted.load(Ordering::SeqCst),
                    speed: *shared.speed.lock(),
                    duration: Duration::from_millis(duration_ms.round() as u64),
                };

                if let Err(e) = shared.device.play(&chunk, params).await {
                    shared.handle_error(e.to_string());
                    break;
                }

                {
                    let mut buffered = shared.buffered_ms.lock();
                    *buffered = (*buffered - duration_ms).max(0.0);
                }
                let _ = shared.event_tx.send(PlaybackEvent::ChunkPlayed {
                    sequence_number: chunk.sequence_number,
                });
            }
        });
        *self.drain_task.lock() = Some(task);
    }
}

impl Drop for AudioPlaybackEngine {
    fn drop(&mut self) {
        if let Some(task) = self.drain_task.lock().take() {
            task.abort();
        }
    }
}

/// In-memory output device for tests and headless runs.
///
/// Records the sequence numbers it finished playing. In realtime mode each
/// chunk occupies the device for its scaled duration; instant mode renders
/// immediately.
pub struct NullOutputDevice {
    played: Mutex<Vec<u64>>,
    realtime: bool,
}

impl NullOutputDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            realtime: true,
        })
    }

    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            realtime: false,
        })
    }

    /// Sequence numbers of chunks played to completion, in order
    pub fn played(&self) -> Vec<u64> {
        self.played.lock().clone()
    }
}

#[async_trait]
impl AudioOutputDevice for NullOutputDevice {
    async fn play(
        &self,
        chunk: &InboundAudioChunk,
        params: PlaybackParams,
    ) -> Result<(), AudioError> {
        if self.realtime {
            tokio::time::sleep(params.duration.div_f32(params.speed)).await;
        }
        self.played.lock().push(chunk.sequence_number);
        Ok(())
    }
}
