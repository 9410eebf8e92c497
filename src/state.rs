//! # Shared Engine State
//!
//! This module manages the state that the session controller, the audio
//! pipeline tasks, and the rendering layer all need to observe: the session
//! lifecycle state, the user-facing status line, and pipeline counters.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: The capture forwarder, the socket reader, and the renderer each
//!   hold a clone of the same state
//! - **RwLock**: Many readers (status polls) or one writer (state transition)
//! - Handlers never hold a lock across an await point; every accessor clones
//!   out the value and releases the lock immediately

use std::sync::{Arc, RwLock};

/// Lifecycle state of the remote streaming session.
///
/// ## Transitions:
/// `Disconnected -> Connecting -> Connected -> Disconnected`, with
/// `Connected -> Error -> Disconnected` on stream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection; a new session may be opened
    Disconnected,
    /// Connection attempt in flight (handle exists, not yet acknowledged)
    Connecting,
    /// Setup acknowledged; audio is flowing both ways
    Connected,
    /// The stream failed; transitions to Disconnected after cleanup
    Error,
}

impl SessionState {
    /// Convert state to string for status rendering and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        }
    }
}

/// Counters updated by the audio pipeline tasks.
///
/// ## What these track:
/// - **frames_sent**: Capture frames encoded and handed to the session
/// - **frames_dropped**: Capture frames discarded because no session was active
/// - **chunks_played**: Inbound audio chunks decoded and scheduled for playback
/// - **malformed_chunks**: Inbound chunks skipped because they failed to decode
/// - **interruptions**: Times the remote party was interrupted by user speech
#[derive(Debug, Default, Clone)]
pub struct PipelineMetrics {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_played: u64,
    pub malformed_chunks: u64,
    pub interruptions: u64,
}

/// Shared state observed across the engine's tasks.
///
/// ## Thread Safety:
/// All fields use Arc<RwLock<T>>; clones of `EngineState` observe and mutate
/// the same underlying values.
#[derive(Debug, Clone)]
pub struct EngineState {
    /// Current session lifecycle state
    session: Arc<RwLock<SessionState>>,

    /// User-facing status line (rendered verbatim by the caller)
    status: Arc<RwLock<String>>,

    /// Pipeline counters
    metrics: Arc<RwLock<PipelineMetrics>>,
}

impl EngineState {
    /// Create a new engine state in the disconnected idle position.
    pub fn new() -> Self {
        Self {
            session: Arc::new(RwLock::new(SessionState::Disconnected)),
            status: Arc::new(RwLock::new(
                "Disconnected. Press Start to begin.".to_string(),
            )),
            metrics: Arc::new(RwLock::new(PipelineMetrics::default())),
        }
    }

    /// Get the current session state.
    pub fn session_state(&self) -> SessionState {
        *self.session.read().unwrap()
    }

    /// Transition the session state.
    pub fn set_session_state(&self, new_state: SessionState) {
        *self.session.write().unwrap() = new_state;
    }

    /// Get a copy of the current status line.
    pub fn status(&self) -> String {
        self.status.read().unwrap().clone()
    }

    /// Replace the status line.
    pub fn set_status(&self, status: &str) {
        *self.status.write().unwrap() = status.to_string();
    }

    /// Record a capture frame delivered to the active session.
    pub fn record_frame_sent(&self) {
        self.metrics.write().unwrap().frames_sent += 1;
    }

    /// Record a capture frame dropped because no session was active.
    pub fn record_frame_dropped(&self) {
        self.metrics.write().unwrap().frames_dropped += 1;
    }

    /// Record an inbound chunk scheduled for playback.
    pub fn record_chunk_played(&self) {
        self.metrics.write().unwrap().chunks_played += 1;
    }

    /// Record an inbound chunk skipped because it failed to decode.
    pub fn record_malformed_chunk(&self) {
        self.metrics.write().unwrap().malformed_chunks += 1;
    }

    /// Record an interruption of the remote party.
    pub fn record_interruption(&self) {
        self.metrics.write().unwrap().interruptions += 1;
    }

    /// Get a snapshot of the pipeline counters.
    ///
    /// Clones the counters so the lock is released before the caller formats
    /// or logs them.
    pub fn metrics_snapshot(&self) -> PipelineMetrics {
        self.metrics.read().unwrap().clone()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = EngineState::new();
        assert_eq!(state.session_state(), SessionState::Disconnected);
        assert_eq!(state.status(), "Disconnected. Press Start to begin.");
    }

    #[test]
    fn test_state_transitions_are_shared() {
        let state = EngineState::new();
        let observer = state.clone();

        state.set_session_state(SessionState::Connecting);
        assert_eq!(observer.session_state(), SessionState::Connecting);

        state.set_session_state(SessionState::Connected);
        state.set_status("Connected. You can start speaking.");
        assert_eq!(observer.session_state(), SessionState::Connected);
        assert_eq!(observer.status(), "Connected. You can start speaking.");
    }

    #[test]
    fn test_metrics_counters() {
        let state = EngineState::new();
        state.record_frame_sent();
        state.record_frame_sent();
        state.record_frame_dropped();
        state.record_malformed_chunk();
        state.record_interruption();

        let snapshot = state.metrics_snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.chunks_played, 0);
        assert_eq!(snapshot.malformed_chunks, 1);
        assert_eq!(snapshot.interruptions, 1);
    }
}
