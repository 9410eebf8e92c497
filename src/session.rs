//! # Live Session Controller
//!
//! Owns the lifecycle of the streaming connection to the live endpoint and
//! coordinates capture and playback with connection state.
//!
//! ## Wire Protocol:
//! 1. **Connect**: WebSocket to the bidirectional generation endpoint, keyed
//!    by the configured model
//! 2. **Setup**: First outbound message carries response modality (audio),
//!    voice identity, and the merged system instruction
//! 3. **Acknowledgment**: The server answers with `setupComplete`; only then
//!    is the session connected
//! 4. **Streaming**: Outbound realtime media chunks (base64 PCM16 at 16kHz);
//!    inbound server content with response audio (24kHz), incremental
//!    assistant text, and a running user transcription
//!
//! ## Per-Message Ordering Contract:
//! Within one inbound message: an interruption signal is handled before any
//! other content, audio parts are awaited into the playback scheduler one at
//! a time (back-pressure), then text and transcription increments are
//! emitted. Ordering across messages follows arrival order; ordering across
//! sources (capture frames, inbound messages, playback completions) is not
//! assumed anywhere.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::capture::CapturePipeline;
use crate::audio::codec::{self, EncodedChunk};
use crate::audio::playback::PlaybackScheduler;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::{EngineState, SessionState};
use crate::transcript::TranscriptEvent;

/// Fixed lead-in of every system instruction; the caller's custom
/// instruction is appended after a blank line.
pub const BASE_SYSTEM_INSTRUCTION: &str = "You are a helpful and friendly conversational AI. \
    Your responses should be concise and to the point. You can be interrupted at any time.";

/// Bidirectional streaming endpoint. The API key is appended as a query
/// parameter and the model is named in the setup message.
const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/\
    google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long to wait for the server's setup acknowledgment.
const SETUP_ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events emitted to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// User-facing status line changed
    Status(String),
    /// A transcript increment to fold into the conversation
    Transcript(TranscriptEvent),
}

// ---------------------------------------------------------------------------
// Outbound wire messages
// ---------------------------------------------------------------------------

/// First message on a fresh connection: model, response modality, voice, and
/// system instruction.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
    input_audio_transcription: EmptyConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmptyConfig {}

impl SetupMessage {
    /// Build the setup message with the merged system instruction.
    pub fn new(model: &str, voice: &str, custom_instruction: &str) -> Self {
        let merged = format!("{}\n\n{}", BASE_SYSTEM_INSTRUCTION, custom_instruction);
        Self {
            setup: Setup {
                model: format!("models/{}", model),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.to_string(),
                            },
                        },
                    },
                },
                system_instruction: SystemInstruction {
                    parts: vec![TextPart { text: merged }],
                },
                input_audio_transcription: EmptyConfig {},
            },
        }
    }
}

/// A realtime media frame: one encoded capture frame per message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

// ---------------------------------------------------------------------------
// Inbound wire messages
// ---------------------------------------------------------------------------

/// One inbound server message. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
}

/// Content payload of a server message.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    /// The remote party was interrupted by user speech
    pub interrupted: bool,
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<InputTranscription>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelTurn {
    pub parts: Vec<ContentPart>,
}

/// One part of a model turn: inline response audio and/or text.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentPart {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InputTranscription {
    pub text: String,
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Items accepted by the socket writer task.
enum Outbound {
    Frame(String),
    Close,
}

/// The outbound half of one live connection.
///
/// ## Invariant:
/// A handle is installed in the controller's slot only while the session
/// state is connecting or connected; `close` and the read-side teardown both
/// remove it.
pub struct SessionHandle {
    id: Uuid,
    opened_at: DateTime<Utc>,
    outbound: UnboundedSender<Outbound>,
}

impl SessionHandle {
    fn new(outbound: UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            outbound,
        }
    }

    /// Unique identifier of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send one encoded capture frame as realtime input.
    pub fn send_media(&self, chunk: EncodedChunk) -> AppResult<()> {
        let message = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: chunk.mime_type,
                    data: chunk.data,
                }],
            },
        };
        let json = serde_json::to_string(&message)?;
        self.outbound
            .send(Outbound::Frame(json))
            .map_err(|_| AppError::Connection("outbound channel closed".to_string()))
    }

    /// Ask the writer task to send a close frame and shut down.
    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

// ---------------------------------------------------------------------------
// Session controller
// ---------------------------------------------------------------------------

/// Coordinates the connection, the capture pipeline, and the playback
/// scheduler.
///
/// ## Resource Model:
/// Every resource acquired by `open`/`start_capture` (output device, socket,
/// microphone) has its matching release in `close`, reachable from every
/// exit path. `close` is safe from any state and never panics.
pub struct SessionController {
    config: AppConfig,
    state: EngineState,
    playback: Arc<PlaybackScheduler>,
    capture: StdMutex<CapturePipeline>,
    session: Arc<RwLock<Option<SessionHandle>>>,
    events: UnboundedSender<EngineEvent>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Create the controller. Nothing is acquired until `open`.
    pub fn new(
        config: AppConfig,
        state: EngineState,
        playback: Arc<PlaybackScheduler>,
        capture: CapturePipeline,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            config,
            state,
            playback,
            capture: StdMutex::new(capture),
            session: Arc::new(RwLock::new(None)),
            events,
            reader: StdMutex::new(None),
        }
    }

    /// Update the status line and notify the rendering layer.
    fn emit_status(&self, status: &str) {
        self.state.set_status(status);
        let _ = self.events.send(EngineEvent::Status(status.to_string()));
    }

    /// Open a live session with the given voice and instruction suffix.
    ///
    /// ## State Transition:
    /// Disconnected -> Connecting -> Connected; any failure lands back on
    /// Disconnected with a surfaced status message. A missing credential is
    /// rejected before any device or network resource is touched.
    pub async fn open(&self, voice: &str, custom_instruction: &str) -> AppResult<()> {
        if self.state.session_state() != SessionState::Disconnected {
            return Ok(());
        }

        if !self.config.has_credential() {
            self.emit_status("API_KEY not configured. Set GEMINI_API_KEY to begin.");
            return Err(AppError::Configuration(
                "API key not configured".to_string(),
            ));
        }

        self.state.set_session_state(SessionState::Connecting);
        self.emit_status("Connecting...");

        // The output clock opens with the session and closes with it.
        if let Err(err) = self.playback.open_device() {
            self.state.set_session_state(SessionState::Disconnected);
            self.emit_status("Audio output unavailable.");
            return Err(err);
        }

        let url = format!("{}?key={}", LIVE_ENDPOINT, self.config.api.api_key);
        let socket = match connect_async(url).await {
            Ok((socket, _response)) => socket,
            Err(err) => {
                error!(error = %err, "failed to connect");
                self.playback.close_device();
                self.state.set_session_state(SessionState::Disconnected);
                self.emit_status("Failed to connect. Please try again.");
                return Err(err.into());
            }
        };

        let (mut sink, mut stream) = socket.split();

        // Writer task: owns the sink half, drains the outbound channel.
        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let setup = SetupMessage::new(&self.config.api.model, voice, custom_instruction);
        let setup_result = serde_json::to_string(&setup)
            .map_err(AppError::from)
            .and_then(|json| {
                outbound_tx
                    .send(Outbound::Frame(json))
                    .map_err(|_| AppError::Connection("writer task gone".to_string()))
            });

        let ack = match setup_result {
            Ok(()) => await_setup_ack(&mut stream).await,
            Err(err) => Err(err),
        };

        if let Err(err) = ack {
            error!(error = %err, "session setup failed");
            let _ = outbound_tx.send(Outbound::Close);
            self.playback.close_device();
            self.state.set_session_state(SessionState::Disconnected);
            self.emit_status("Failed to connect. Please try again.");
            return Err(err);
        }

        let handle = SessionHandle::new(outbound_tx);
        info!(session_id = %handle.id(), voice, "session established");
        *self.session.write().await = Some(handle);

        // Reader task: applies the per-message ordering contract until the
        // stream ends, then tears down from the read side.
        let session = Arc::clone(&self.session);
        let playback = Arc::clone(&self.playback);
        let state = self.state.clone();
        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            read_loop(stream, session, playback, state, events).await;
        });
        *self.reader.lock().unwrap() = Some(reader);

        self.state.set_session_state(SessionState::Connected);
        self.emit_status("Connected. You can start speaking.");
        Ok(())
    }

    /// Start microphone capture.
    ///
    /// On denial the open session (if any) is torn down and the denial is
    /// surfaced as the status line.
    pub async fn start_capture(&self) -> AppResult<()> {
        let result = { self.capture.lock().unwrap().start() };

        if let Err(err) = result {
            warn!(error = %err, "microphone unavailable");
            self.close().await;
            self.emit_status("Microphone access denied.");
            return Err(err);
        }

        Ok(())
    }

    /// Consume capture frames: encode and forward to the active session,
    /// or drop when none is installed.
    ///
    /// Frames are never queued for a future session; a dropped frame is
    /// only counted.
    pub fn spawn_frame_forwarder(&self, mut frames: UnboundedReceiver<Vec<f32>>) {
        let session = Arc::clone(&self.session);
        let state = self.state.clone();
        let sample_rate = self.config.audio.capture_sample_rate;

        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let guard = session.read().await;
                match guard.as_ref() {
                    Some(handle) => {
                        let chunk = codec::encode_outbound(&frame, sample_rate);
                        if handle.send_media(chunk).is_ok() {
                            state.record_frame_sent();
                        } else {
                            state.record_frame_dropped();
                        }
                    }
                    None => state.record_frame_dropped(),
                }
            }
        });
    }

    /// Close the session and release every acquired resource. Idempotent.
    ///
    /// ## Teardown Order:
    /// 1. Stop capture (release the microphone)
    /// 2. Force an interruption (silence in-flight output)
    /// 3. Close the remote connection
    /// 4. Close the output clock
    /// 5. Transition to Disconnected
    pub async fn close(&self) {
        {
            self.capture.lock().unwrap().stop();
        }

        self.playback.interrupt();

        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }

        let handle = self.session.write().await.take();
        if let Some(handle) = &handle {
            handle.close();
            let duration = Utc::now()
                .signed_duration_since(handle.opened_at)
                .num_seconds();
            info!(session_id = %handle.id(), duration_s = duration, "session closed");
        }

        self.playback.close_device();

        // Only announce the transition once; repeated closes are silent.
        if self.state.session_state() != SessionState::Disconnected || handle.is_some() {
            self.state.set_session_state(SessionState::Disconnected);
            self.emit_status("Disconnected. Press Start to begin.");
        }
    }
}

/// Wait for the server's `setupComplete` acknowledgment.
async fn await_setup_ack(stream: &mut SplitStream<WsStream>) -> AppResult<()> {
    let ack = tokio::time::timeout(SETUP_ACK_TIMEOUT, async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Some(parsed) = parse_server_message(text.as_bytes()) {
                        if parsed.setup_complete.is_some() {
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Binary(bytes)) => {
                    if let Some(parsed) = parse_server_message(&bytes) {
                        if parsed.setup_complete.is_some() {
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    return Err(AppError::Connection(
                        "stream closed during setup".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(AppError::Connection("stream ended during setup".to_string()))
    })
    .await;

    match ack {
        Ok(result) => result,
        Err(_) => Err(AppError::Connection(
            "setup acknowledgment timed out".to_string(),
        )),
    }
}

/// Parse one inbound payload; malformed JSON is logged and skipped.
fn parse_server_message(payload: &[u8]) -> Option<ServerMessage> {
    match serde_json::from_slice(payload) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, "skipping unparseable server message");
            None
        }
    }
}

/// Drain the inbound stream until it ends, then tear down from the read side.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    session: Arc<RwLock<Option<SessionHandle>>>,
    playback: Arc<PlaybackScheduler>,
    state: EngineState,
    events: UnboundedSender<EngineEvent>,
) {
    let mut failed = false;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(parsed) = parse_server_message(text.as_bytes()) {
                    if let Some(content) = parsed.server_content {
                        handle_server_content(content, &playback, &state, &events).await;
                    }
                }
            }
            Ok(Message::Binary(bytes)) => {
                if let Some(parsed) = parse_server_message(&bytes) {
                    if let Some(content) = parsed.server_content {
                        handle_server_content(content, &playback, &state, &events).await;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "server closed the stream");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "session stream failed");
                failed = true;
                break;
            }
        }
    }

    // The user-initiated path empties the slot first; if the handle is still
    // here, the stream ended on the remote side.
    if session.write().await.take().is_some() {
        if failed {
            state.set_session_state(SessionState::Error);
            state.set_status("Connection error. Please try again.");
            let _ = events.send(EngineEvent::Status(
                "Connection error. Please try again.".to_string(),
            ));
            state.set_session_state(SessionState::Disconnected);
        } else {
            state.set_session_state(SessionState::Disconnected);
            state.set_status("Disconnected. Press Start to begin.");
            let _ = events.send(EngineEvent::Status(
                "Disconnected. Press Start to begin.".to_string(),
            ));
        }
    }
}

/// Apply one message's server content in order.
///
/// ## Ordering:
/// 1. An interruption silences all in-flight output before any other part
///    of the same message is considered
/// 2. Audio parts are decoded and awaited into the scheduler one at a time;
///    a malformed chunk is counted and skipped, never fatal
/// 3. Assistant text and user transcription become transcript increments
async fn handle_server_content(
    content: ServerContent,
    playback: &PlaybackScheduler,
    state: &EngineState,
    events: &UnboundedSender<EngineEvent>,
) {
    if content.interrupted {
        debug!("interrupted by user speech; fading out");
        playback.interrupt();
        state.record_interruption();
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                match codec::decode_inbound(&inline.data) {
                    Ok(samples) => {
                        playback.enqueue(samples).await;
                        state.record_chunk_played();
                    }
                    Err(err) => {
                        warn!(error = %err, "skipping malformed audio chunk");
                        state.record_malformed_chunk();
                    }
                }
            }

            if let Some(text) = part.text {
                if !text.is_empty() {
                    let _ = events.send(EngineEvent::Transcript(
                        TranscriptEvent::AssistantText(text),
                    ));
                }
            }
        }
    }

    if let Some(transcription) = content.input_transcription {
        if !transcription.text.is_empty() {
            let _ = events.send(EngineEvent::Transcript(
                TranscriptEvent::UserTranscription(transcription.text),
            ));
        }
    }
}
