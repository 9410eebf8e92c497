//! # Gemini Voice Client - Main Application Entry Point
//!
//! Console front end for the real-time voice session engine. It owns the
//! presentational glue only: it loads configuration, opens a session with the
//! configured voice and instruction suffix, starts microphone capture, and
//! renders status lines and the live transcript to the terminal until Ctrl+C.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (TOML file + environment variables)
//! - **state**: Shared session state, status line, and pipeline counters
//! - **audio**: Capture, codec, and playback scheduling
//! - **session**: Lifecycle of the remote streaming connection
//! - **transcript**: Merge/replace reducer for conversation messages
//! - **error**: Error taxonomy surfaced as status text

// Module declarations - These tell Rust about our other source files
mod audio; // Capture, codec, playback (audio/ directory)
mod config; // Configuration management (config.rs)
mod error; // Error handling types (error.rs)
mod session; // Session controller and wire protocol (session.rs)
mod state; // Shared engine state (state.rs)
mod transcript; // Transcript reducer (transcript.rs)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio::capture::CapturePipeline;
use audio::playback::PlaybackScheduler;
use config::AppConfig;
use session::{EngineEvent, SessionController};
use state::EngineState;
use transcript::TranscriptMessage;

/// Global shutdown signal set by the signal handlers and polled by the
/// render loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Wires the pipeline**: playback scheduler, capture, session controller
/// 4. **Opens the session and starts capture**
/// 5. **Renders events** until a shutdown signal arrives, then tears down
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting gemini-voice-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        voice = %config.api.voice,
        model = %config.api.model,
        "Configuration loaded"
    );

    // Shared state and the event channel the renderer drains.
    let engine_state = EngineState::new();
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();

    // Capture frames flow over their own channel into the forwarder task.
    let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel();

    let playback = Arc::new(PlaybackScheduler::new(&config.audio));
    let capture = CapturePipeline::new(&config.audio, frame_tx);

    let controller = Arc::new(SessionController::new(
        config.clone(),
        engine_state.clone(),
        playback,
        capture,
        event_tx,
    ));
    controller.spawn_frame_forwarder(frame_rx);

    setup_signal_handlers();

    if let Err(err) = controller.open(&config.api.voice, &config.api.custom_instruction).await {
        error!("Failed to open session: {}", err);
        println!("-- {}", engine_state.status());
        return Ok(());
    }

    if let Err(err) = controller.start_capture().await {
        error!("Failed to start capture: {}", err);
        println!("-- {}", engine_state.status());
        return Ok(());
    }

    // Render loop: fold transcript increments and print status changes until
    // the session ends or a shutdown signal arrives.
    let mut messages: Vec<TranscriptMessage> = Vec::new();
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(EngineEvent::Status(status)) => {
                        println!("-- {}", status);
                    }
                    Some(EngineEvent::Transcript(increment)) => {
                        transcript::apply(&mut messages, increment);
                        if let Some(last) = messages.last() {
                            println!("{}: {}", last.role.as_str(), last.text);
                        }
                    }
                    None => break,
                }
            }
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, closing session...");
                controller.close().await;
                break;
            }
        }
    }

    let metrics = engine_state.metrics_snapshot();
    info!(
        state = engine_state.session_state().as_str(),
        frames_sent = metrics.frames_sent,
        frames_dropped = metrics.frames_dropped,
        chunks_played = metrics.chunks_played,
        malformed_chunks = metrics.malformed_chunks,
        interruptions = metrics.interruptions,
        "Session ended"
    );

    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "gemini_voice_client=debug")
/// - If not set, defaults to "gemini_voice_client=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gemini_voice_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT; whichever arrives first sets the global
/// shutdown flag so the render loop can close the session before exiting.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls the flag every 100ms; returns once shutdown has been requested.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
