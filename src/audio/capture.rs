//! # Microphone Capture
//!
//! Acquires the microphone, slices the input stream into fixed-size frames,
//! and forwards each frame to the session layer for encoding and transport.
//!
//! ## State Machine:
//! `Idle -> RequestingPermission -> Capturing -> Idle`
//!
//! ## Real-Time Contract:
//! Frames are forwarded the moment they complete; when no session is active
//! the session layer drops them. Nothing is ever buffered for later — stale
//! microphone audio has no value in a live conversation.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};

/// Current position in the capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No stream; the microphone is released
    Idle,
    /// Opening the input device
    RequestingPermission,
    /// Input stream running; frames are being delivered
    Capturing,
}

impl CaptureState {
    /// Convert state to string for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::RequestingPermission => "requesting-permission",
            CaptureState::Capturing => "capturing",
        }
    }
}

/// Slices arbitrary-length callback buffers into exact fixed-size frames.
///
/// The input device delivers whatever buffer sizes the platform chooses; the
/// transport wants exact frames. Leftover samples carry over to the next push.
#[derive(Debug)]
pub struct FrameChunker {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    /// Create a chunker emitting frames of exactly `frame_size` samples.
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Feed captured samples; returns every frame completed by this push.
    pub fn push(&mut self, input: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(input);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Samples held back waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Handle to the thread that owns the cpal input stream.
struct CaptureDevice {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// The capture side of the pipeline.
///
/// ## Thread Model:
/// cpal streams are not `Send`, so the input stream lives on a dedicated
/// thread; `start` spawns it and `stop` signals it to drop the stream, which
/// releases the microphone deterministically.
pub struct CapturePipeline {
    state: CaptureState,
    frame_size: usize,
    sample_rate: u32,
    frames: UnboundedSender<Vec<f32>>,
    device: Option<CaptureDevice>,
}

impl CapturePipeline {
    /// Create the capture pipeline.
    ///
    /// ## Parameters:
    /// - **config**: Capture rate and frame size
    /// - **frames**: Channel on which completed frames are delivered
    pub fn new(config: &AudioConfig, frames: UnboundedSender<Vec<f32>>) -> Self {
        Self {
            state: CaptureState::Idle,
            frame_size: config.frame_size,
            sample_rate: config.capture_sample_rate,
            frames,
            device: None,
        }
    }

    /// Request the microphone and begin delivering frames.
    ///
    /// ## State Transition:
    /// Idle -> RequestingPermission -> Capturing on success; back to Idle on
    /// failure. Calling while already capturing is a no-op.
    ///
    /// ## Errors:
    /// `AppError::PermissionDenied` when no input device exists, no usable
    /// config is found, or the stream cannot be opened. The session
    /// controller reacts by tearing down any open session.
    pub fn start(&mut self) -> AppResult<()> {
        if self.state == CaptureState::Capturing {
            return Ok(());
        }

        self.state = CaptureState::RequestingPermission;
        debug!(state = self.state.as_str(), "requesting microphone access");

        let frame_size = self.frame_size;
        let sample_rate = self.sample_rate;
        let frames = self.frames.clone();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::spawn(move || {
            let stream = match build_input_stream(frame_size, sample_rate, frames) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            // Block until stop() signals; dropping the stream releases the mic.
            let _ = shutdown_rx.recv();
            drop(stream);
            debug!("microphone released");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.device = Some(CaptureDevice {
                    shutdown: shutdown_tx,
                    thread,
                });
                self.state = CaptureState::Capturing;
                debug!(sample_rate, frame_size, "capture started");
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                self.state = CaptureState::Idle;
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                self.state = CaptureState::Idle;
                Err(AppError::PermissionDenied(
                    "capture thread died before the stream opened".to_string(),
                ))
            }
        }
    }

    /// Release the microphone and return to idle. Idempotent.
    pub fn stop(&mut self) {
        if let Some(device) = self.device.take() {
            let _ = device.shutdown.send(());
            let _ = device.thread.join();
            debug!("capture stopped");
        }
        self.state = CaptureState::Idle;
    }

    /// Current capture state.
    pub fn state(&self) -> CaptureState {
        self.state
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the default input device and build the framing stream.
///
/// Requires a mono config at the configured rate, matching the speech input
/// format the remote endpoint expects.
fn build_input_stream(
    frame_size: usize,
    sample_rate: u32,
    frames: UnboundedSender<Vec<f32>>,
) -> AppResult<cpal::Stream> {
    let host = cpal::default_host();

    let device = host.default_input_device().ok_or_else(|| {
        AppError::PermissionDenied("no input device available".to_string())
    })?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| AppError::PermissionDenied(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| {
            AppError::PermissionDenied("no suitable input config found".to_string())
        })?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();

    debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "input stream configured"
    );

    let mut chunker = FrameChunker::new(frame_size);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in chunker.push(data) {
                    // Receiver gone means the engine is shutting down.
                    let _ = frames.send(frame);
                }
            },
            |err| {
                warn!(error = %err, "capture stream error");
            },
            None,
        )
        .map_err(|e| AppError::PermissionDenied(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AppError::PermissionDenied(e.to_string()))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_chunker_emits_exact_frames() {
        let mut chunker = FrameChunker::new(4);
        let frames = chunker.push(&[0.1, 0.2, 0.3, 0.4, 0.5]);

        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4]]);
        assert_eq!(chunker.pending_len(), 1);
    }

    #[test]
    fn test_chunker_carries_remainder_across_pushes() {
        let mut chunker = FrameChunker::new(4);
        assert!(chunker.push(&[0.1, 0.2]).is_empty());
        assert!(chunker.push(&[0.3]).is_empty());

        let frames = chunker.push(&[0.4, 0.5]);
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4]]);
        assert_eq!(chunker.pending_len(), 1);
    }

    #[test]
    fn test_chunker_emits_multiple_frames_per_push() {
        let mut chunker = FrameChunker::new(2);
        let frames = chunker.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(frames, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(chunker.pending_len(), 1);
    }

    #[test]
    fn test_chunker_empty_push_is_harmless() {
        let mut chunker = FrameChunker::new(4);
        assert!(chunker.push(&[]).is_empty());
        assert_eq!(chunker.pending_len(), 0);
    }

    #[test]
    fn test_stop_without_start_is_idempotent() {
        let config = AppConfig::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut capture = CapturePipeline::new(&config.audio, tx);

        assert_eq!(capture.state(), CaptureState::Idle);
        capture.stop();
        capture.stop();
        assert_eq!(capture.state(), CaptureState::Idle);
    }
}
