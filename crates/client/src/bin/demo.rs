//! Avatar Voice Demo Entry Point
//!
//! Wires the full pipeline against null audio devices: a synthetic signal
//! generator feeds the capture engine while the playback engine renders to
//! a silent sink. Useful for exercising the conversation protocol against a
//! real service endpoint without audio hardware.

use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use avatar_voice_audio::{
    AudioCaptureEngine, AudioPlaybackEngine, CaptureConfig, NullInputDevice, NullOutputDevice,
    PlaybackConfig,
};
use avatar_voice_client::{ConversationEvent, ConversationOrchestrator, OrchestratorConfig};
use avatar_voice_config::{load_settings, Settings};
use avatar_voice_transport::{ConnectionConfig, ConnectionSession, WebSocketTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(std::env::var("AVATAR_VOICE_ENV").ok().as_deref())?;

    init_tracing(&settings);

    tracing::info!("Starting Avatar Voice Demo v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(url = %settings.connection.url, "Loaded configuration");

    let transport = Box::new(WebSocketTransport::new());
    let connection = ConnectionSession::new(
        transport,
        ConnectionConfig {
            url: settings.connection.url.clone(),
            auth_token: settings.connection.auth_token.clone(),
            auth_timeout: Duration::from_millis(settings.connection.auth_timeout_ms),
            reconnect_enabled: settings.connection.reconnect_enabled,
            max_reconnect_attempts: settings.connection.max_reconnect_attempts,
            reconnect_initial_delay: Duration::from_millis(
                settings.connection.reconnect_initial_delay_ms,
            ),
            reconnect_max_delay: Duration::from_millis(settings.connection.reconnect_max_delay_ms),
        },
    );

    let input_device = NullInputDevice::new();
    let sample_sender = input_device.sender_slot();
    let capture = AudioCaptureEngine::new(
        Box::new(input_device),
        CaptureConfig {
            chunk_duration_ms: settings.capture.chunk_duration_ms,
            silence_threshold_db: settings.capture.silence_threshold_db,
            ..CaptureConfig::default()
        },
    );

    let output_device = NullOutputDevice::new();
    let playback = AudioPlaybackEngine::new(
        output_device,
        PlaybackConfig {
            buffer_target_ms: settings.playback.buffer_target_ms,
            initial_volume: settings.playback.volume,
            initial_speed: settings.playback.speed,
            ..PlaybackConfig::default()
        },
    );

    let orchestrator = ConversationOrchestrator::new(
        connection,
        capture,
        playback,
        OrchestratorConfig {
            end_of_utterance_silence: Duration::from_millis(
                settings.conversation.end_of_utterance_silence_ms,
            ),
            barge_in_confirmation: Duration::from_millis(
                settings.conversation.barge_in_confirmation_ms,
            ),
            barge_in_enabled: settings.conversation.barge_in_enabled,
        },
    );

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConversationEvent::StateChanged { old, new } => {
                    tracing::info!(?old, ?new, "conversation state");
                }
                ConversationEvent::SessionReady { session_id } => {
                    tracing::info!(%session_id, "session ready");
                }
                ConversationEvent::Transcript {
                    transcript,
                    is_final,
                    ..
                } => {
                    tracing::info!(is_final, "transcript: {transcript}");
                }
                ConversationEvent::Interrupted { turn_index } => {
                    tracing::info!(turn_index, "interrupted");
                }
                ConversationEvent::Reconnecting { attempt } => {
                    tracing::warn!(attempt, "reconnecting");
                }
                ConversationEvent::Error {
                    message,
                    recoverable,
                } => {
                    tracing::error!(recoverable, "error: {message}");
                }
                _ => {}
            }
        }
    });

    orchestrator.connect().await?;
    orchestrator.start_listening().await?;

    // Synthetic microphone: alternate a short burst of tone with silence so
    // the endpointing path gets exercised.
    let generator = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        let mut elapsed_ms: u64 = 0;
        loop {
            ticker.tick().await;
            let speaking = (elapsed_ms / 2_000) % 2 == 0;
            let block: Vec<f32> = if speaking {
                (0..1600).map(|i| 0.4 * (i as f32 * 0.2).sin()).collect()
            } else {
                vec![0.0; 1600]
            };
            // The slot is empty until the capture device opens. Take the
            // clone out of the guard before awaiting; the lock must not be
            // held across the send.
            let tx = sample_sender.lock().clone();
            if let Some(tx) = tx {
                if tx.send(block).await.is_err() {
                    break;
                }
            }
            elapsed_ms += 100;
        }
    });

    shutdown_signal().await;
    tracing::info!("shutting down");

    generator.abort();
    orchestrator.disconnect().await?;

    tracing::info!("demo shutdown complete");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("avatar_voice={}", settings.observability.log_level).into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
