//! # Playback Scheduling
//!
//! Schedules decoded response audio for gapless, in-order output on a
//! dedicated output clock, and fades it out inaudibly when the remote party
//! is interrupted.
//!
//! ## Structure:
//! - **SampleClock**: Monotonic sample-frame counter advanced by the output
//!   device callback. "Now" is a frame index, not wall time, so scheduling is
//!   sample-accurate and testable without hardware.
//! - **Scheduler**: The live set of playback units plus the cursor (next
//!   available start frame). Pure bookkeeping plus a `mix_into` render pass;
//!   no device handles.
//! - **PlaybackScheduler**: Owns the Scheduler and the output device thread.
//!   The cpal stream is kept on its own thread because streams are not `Send`.
//!
//! ## Scheduling Contract:
//! A chunk starts at `max(cursor, clock.now())`: back-to-back chunks are
//! gapless when they arrive faster than they play, and a late chunk starts at
//! "now" rather than in the past. The cursor then advances by the chunk's
//! duration, so enqueue order is playback order regardless of arrival jitter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tracing::{debug, warn};

use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};

/// Monotonic output clock measured in sample frames.
///
/// The device callback advances it by the number of frames it renders; every
/// scheduling decision reads it through `now()`.
#[derive(Debug)]
pub struct SampleClock {
    frames: AtomicU64,
}

impl SampleClock {
    fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
        }
    }

    /// Current clock position in sample frames.
    pub fn now(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Advance the clock after rendering `count` frames.
    fn advance(&self, count: u64) {
        self.frames.fetch_add(count, Ordering::AcqRel);
    }
}

/// A scheduled linear change of a unit's gain over a frame window.
#[derive(Debug, Clone, Copy)]
struct GainRamp {
    start: u64,
    end: u64,
    from: f32,
    to: f32,
}

/// One decoded audio buffer with its own gain control and scheduled window.
///
/// ## Lifetime:
/// Created by `enqueue`, owned by the scheduler's live set. Removed either by
/// natural completion during a mix pass or by the forced stop installed by
/// `interrupt`.
#[derive(Debug)]
struct PlaybackUnit {
    samples: Vec<f32>,
    start: u64,
    gain: f32,
    ramp: Option<GainRamp>,
    stop_at: Option<u64>,
}

impl PlaybackUnit {
    /// Frame one past the last sample, ignoring any forced stop.
    fn natural_end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }

    /// Frame at which this unit stops producing audio.
    fn effective_end(&self) -> u64 {
        match self.stop_at {
            Some(stop) => stop.min(self.natural_end()),
            None => self.natural_end(),
        }
    }

    /// Gain multiplier at the given clock frame.
    fn gain_at(&self, frame: u64) -> f32 {
        match self.ramp {
            Some(ramp) if frame >= ramp.end => ramp.to,
            Some(ramp) if frame <= ramp.start => ramp.from,
            Some(ramp) => {
                let progress =
                    (frame - ramp.start) as f32 / (ramp.end - ramp.start) as f32;
                ramp.from + (ramp.to - ramp.from) * progress
            }
            None => self.gain,
        }
    }

    /// Rendered value at the given clock frame (zero outside the window).
    fn sample_at(&self, frame: u64) -> f32 {
        if frame < self.start || frame >= self.effective_end() {
            return 0.0;
        }
        self.samples[(frame - self.start) as usize] * self.gain_at(frame)
    }

    /// Whether the unit has nothing left to play at the given clock frame.
    fn is_finished(&self, frame: u64) -> bool {
        frame >= self.effective_end()
    }
}

/// Live set and cursor behind one mutex; lock hold times are one mix pass or
/// one bookkeeping update.
#[derive(Debug, Default)]
struct SchedulerInner {
    units: Vec<PlaybackUnit>,
    cursor: u64,
}

/// Device-independent scheduling core.
///
/// ## Thread Safety:
/// Shared between the device callback (mix pass), the session's inbound
/// handler (enqueue), and the interruption path (fade-out). All state sits
/// behind one mutex plus the atomic clock.
#[derive(Debug)]
pub struct Scheduler {
    clock: SampleClock,
    inner: Mutex<SchedulerInner>,
    fade_out_frames: u64,
}

impl Scheduler {
    /// Create a scheduler for the given output rate and fade-out window.
    pub fn new(sample_rate: u32, fade_out_ms: u32) -> Self {
        Self {
            clock: SampleClock::new(),
            inner: Mutex::new(SchedulerInner::default()),
            fade_out_frames: u64::from(fade_out_ms) * u64::from(sample_rate) / 1000,
        }
    }

    /// Output clock, for scheduling decisions and tests.
    pub fn clock(&self) -> &SampleClock {
        &self.clock
    }

    /// Register a decoded chunk at the next available start frame.
    ///
    /// ## Returns:
    /// The scheduled start frame.
    pub fn enqueue(&self, samples: Vec<f32>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let start = inner.cursor.max(now);
        let duration = samples.len() as u64;

        if duration > 0 {
            inner.units.push(PlaybackUnit {
                samples,
                start,
                gain: 1.0,
                ramp: None,
                stop_at: None,
            });
        }

        inner.cursor = start + duration;
        start
    }

    /// Render one buffer of mono output and advance the clock.
    ///
    /// Sums every live unit's contribution per frame, then drops units whose
    /// window has fully passed — the natural-completion self-removal.
    pub fn mix_into(&self, out: &mut [f32]) {
        let base = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        for (offset, slot) in out.iter_mut().enumerate() {
            let frame = base + offset as u64;
            let mut mixed = 0.0f32;
            for unit in &inner.units {
                mixed += unit.sample_at(frame);
            }
            *slot = mixed;
        }

        let rendered_to = base + out.len() as u64;
        inner.units.retain(|unit| !unit.is_finished(rendered_to));
        drop(inner);

        self.clock.advance(out.len() as u64);
    }

    /// Fade every live unit to silence and reset the cursor.
    ///
    /// Each unit gets a linear ramp from its current gain down to zero over
    /// the fade-out window, plus a hard stop at the ramp's end. A unit that
    /// already carries an earlier stop keeps it — stopping twice is a no-op,
    /// never an error. The cursor resets to zero so the next enqueue anchors
    /// at the clock's current position instead of a stale future frame.
    ///
    /// ## Returns:
    /// Number of units that were live when the fade was issued.
    pub fn fade_out_all(&self) -> usize {
        let now = self.clock.now();
        let fade_end = now + self.fade_out_frames;
        let mut inner = self.inner.lock().unwrap();

        for unit in inner.units.iter_mut() {
            let current = unit.gain_at(now);
            unit.ramp = Some(GainRamp {
                start: now,
                end: fade_end,
                from: current,
                to: 0.0,
            });
            unit.stop_at = Some(match unit.stop_at {
                Some(existing) => existing.min(fade_end),
                None => fade_end,
            });
        }

        inner.cursor = 0;
        inner.units.len()
    }

    /// Drop every unit from the live set.
    pub fn clear_units(&self) {
        self.inner.lock().unwrap().units.clear();
    }

    /// Number of units currently in the live set.
    pub fn live_units(&self) -> usize {
        self.inner.lock().unwrap().units.len()
    }

    /// Next available start frame.
    pub fn cursor(&self) -> u64 {
        self.inner.lock().unwrap().cursor
    }
}

#[cfg(test)]
impl Scheduler {
    /// Scheduled (start, effective end) spans of the live set, in enqueue order.
    fn scheduled_spans(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .unwrap()
            .units
            .iter()
            .map(|unit| (unit.start, unit.effective_end()))
            .collect()
    }
}

/// Commands accepted by the output device thread.
enum DeviceCommand {
    Resume,
    Shutdown,
}

/// Handle to the thread that owns the cpal output stream.
struct OutputDevice {
    commands: mpsc::Sender<DeviceCommand>,
    thread: JoinHandle<()>,
}

/// The playback side of the pipeline: scheduling core plus output device.
///
/// ## Lifecycle:
/// `open_device` is called when a session opens and `close_device` when it
/// closes; `enqueue` and `interrupt` work with or without a device (the clock
/// simply does not advance until the device renders), which keeps the
/// scheduling behavior observable in tests.
pub struct PlaybackScheduler {
    scheduler: Arc<Scheduler>,
    sample_rate: u32,
    clear_grace: Duration,
    device: Mutex<Option<OutputDevice>>,
    running: AtomicBool,
}

impl PlaybackScheduler {
    /// Create the playback scheduler from the audio configuration.
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new(
                config.playback_sample_rate,
                config.fade_out_ms,
            )),
            sample_rate: config.playback_sample_rate,
            clear_grace: Duration::from_millis(u64::from(
                config.fade_out_ms + config.clear_grace_ms,
            )),
            device: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Open the output clock: spawn the device thread and build the stream.
    ///
    /// The stream starts suspended; the first `enqueue` resumes it. Calling
    /// this while a device is already open is a no-op.
    ///
    /// ## Errors:
    /// Returns `AppError::Audio` if no output device exists or no usable
    /// stream config is found.
    pub fn open_device(&self) -> AppResult<()> {
        let mut device = self.device.lock().unwrap();
        if device.is_some() {
            return Ok(());
        }

        let scheduler = Arc::clone(&self.scheduler);
        let sample_rate = self.sample_rate;
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        // cpal streams are not Send; the stream lives and dies on this thread.
        let thread = std::thread::spawn(move || {
            let stream = match build_output_stream(&scheduler, sample_rate) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            loop {
                match command_rx.recv() {
                    Ok(DeviceCommand::Resume) => {
                        if let Err(err) = stream.play() {
                            warn!(error = %err, "failed to resume output stream");
                        }
                    }
                    Ok(DeviceCommand::Shutdown) | Err(_) => break,
                }
            }

            drop(stream);
            debug!("output device released");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *device = Some(OutputDevice {
                    commands: command_tx,
                    thread,
                });
                debug!(sample_rate, "output device opened");
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::Audio("output device thread died".to_string()))
            }
        }
    }

    /// Close the output clock if open. Idempotent.
    pub fn close_device(&self) {
        let taken = self.device.lock().unwrap().take();
        if let Some(device) = taken {
            let _ = device.commands.send(DeviceCommand::Shutdown);
            let _ = device.thread.join();
        }
        self.running.store(false, Ordering::Release);
    }

    /// Schedule a decoded chunk for playback.
    ///
    /// Resumes the output clock first if it is suspended, then registers the
    /// chunk at `max(cursor, now)`. Awaited by the inbound handler so a flood
    /// of audio parts inside one message cannot outrun the scheduler.
    pub async fn enqueue(&self, samples: Vec<f32>) {
        if !self.running.swap(true, Ordering::AcqRel) {
            if let Some(device) = self.device.lock().unwrap().as_ref() {
                let _ = device.commands.send(DeviceCommand::Resume);
            }
        }

        let start = self.scheduler.enqueue(samples);
        debug!(start, "chunk scheduled");
    }

    /// Silence all in-flight and queued output.
    ///
    /// Issues the fade-out and forced stops synchronously, then clears the
    /// live set after the fade window plus a grace margin so natural
    /// completions fire first.
    pub fn interrupt(&self) {
        let affected = self.scheduler.fade_out_all();
        debug!(affected, "interrupt: fading out live units");

        let scheduler = Arc::clone(&self.scheduler);
        let grace = self.clear_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            scheduler.clear_units();
        });
    }

    /// The scheduling core, shared for introspection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close_device();
    }
}

/// Find an output config and build the stream that renders the scheduler.
///
/// Prefers a mono config at the requested rate, falling back to stereo with
/// the mono mix copied to every channel.
fn build_output_stream(
    scheduler: &Arc<Scheduler>,
    sample_rate: u32,
) -> AppResult<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| AppError::Audio("no output device available".to_string()))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| AppError::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| AppError::Audio("no suitable output config found".to_string()))?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = config.channels as usize;

    debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "output stream configured"
    );

    let scheduler = Arc::clone(scheduler);
    let mut mono = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                if mono.len() < frames {
                    mono.resize(frames, 0.0);
                }
                scheduler.mix_into(&mut mono[..frames]);

                for (frame, slots) in data.chunks_mut(channels).enumerate() {
                    for slot in slots.iter_mut() {
                        *slot = mono[frame];
                    }
                }
            },
            |err| {
                warn!(error = %err, "output stream error");
            },
            None,
        )
        .map_err(|e| AppError::Audio(e.to_string()))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn test_scheduler() -> Scheduler {
        // 24kHz output, 30ms fade => 720-frame ramp
        Scheduler::new(24000, 30)
    }

    #[test]
    fn test_back_to_back_chunks_are_gapless() {
        let scheduler = test_scheduler();
        scheduler.enqueue(vec![0.1; 100]);
        scheduler.enqueue(vec![0.2; 150]);
        scheduler.enqueue(vec![0.3; 50]);

        assert_eq!(
            scheduler.scheduled_spans(),
            vec![(0, 100), (100, 250), (250, 300)]
        );
        assert_eq!(scheduler.cursor(), 300);
    }

    #[test]
    fn test_cursor_is_monotonic_across_enqueues() {
        let scheduler = test_scheduler();
        let mut previous = 0;
        for length in [64u64, 128, 32, 256] {
            scheduler.enqueue(vec![0.0; length as usize]);
            let cursor = scheduler.cursor();
            assert!(cursor >= previous);
            assert_eq!(cursor, previous + length);
            previous = cursor;
        }
    }

    #[test]
    fn test_late_chunk_anchors_at_clock_now() {
        let scheduler = test_scheduler();
        scheduler.enqueue(vec![0.1; 100]);

        // Render past the first chunk's end; the clock is now ahead of the cursor.
        let mut out = vec![0.0f32; 250];
        scheduler.mix_into(&mut out);
        assert_eq!(scheduler.clock().now(), 250);

        scheduler.enqueue(vec![0.2; 100]);
        assert_eq!(scheduler.scheduled_spans(), vec![(250, 350)]);
        assert_eq!(scheduler.cursor(), 350);
    }

    #[test]
    fn test_mix_renders_samples_and_self_removes() {
        let scheduler = test_scheduler();
        scheduler.enqueue(vec![0.5; 4]);
        assert_eq!(scheduler.live_units(), 1);

        let mut out = vec![1.0f32; 8];
        scheduler.mix_into(&mut out);

        assert_eq!(&out[..4], &[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(&out[4..], &[0.0, 0.0, 0.0, 0.0]);
        // Natural completion removed the unit during the mix pass.
        assert_eq!(scheduler.live_units(), 0);
    }

    #[test]
    fn test_fade_out_ramps_to_silence() {
        let scheduler = test_scheduler();
        scheduler.enqueue(vec![1.0; 2400]);

        let mut out = vec![0.0f32; 240];
        scheduler.mix_into(&mut out);
        assert!((out[0] - 1.0).abs() < f32::EPSILON);

        let affected = scheduler.fade_out_all();
        assert_eq!(affected, 1);
        assert_eq!(scheduler.cursor(), 0);

        // Render across the 720-frame ramp: strictly fading, silent at the end.
        let mut ramp = vec![0.0f32; 720];
        scheduler.mix_into(&mut ramp);
        assert!((ramp[0] - 1.0).abs() < 0.01);
        assert!(ramp[360] < 0.6);
        assert!(ramp[719] < 0.01);
        assert!(ramp[100] > ramp[600]);

        // The forced stop fired at the ramp end; the unit is gone.
        assert_eq!(scheduler.live_units(), 0);
    }

    #[test]
    fn test_fade_out_with_no_units_is_a_noop() {
        let scheduler = test_scheduler();
        assert_eq!(scheduler.fade_out_all(), 0);
        assert_eq!(scheduler.fade_out_all(), 0);
        assert_eq!(scheduler.cursor(), 0);
        assert_eq!(scheduler.live_units(), 0);
    }

    #[test]
    fn test_double_fade_keeps_earlier_stop() {
        let scheduler = test_scheduler();
        scheduler.enqueue(vec![1.0; 4800]);

        scheduler.fade_out_all();
        let first_stop = scheduler.scheduled_spans()[0].1;

        let mut out = vec![0.0f32; 120];
        scheduler.mix_into(&mut out);

        // A second fade must not extend the already-scheduled stop.
        scheduler.fade_out_all();
        let second_stop = scheduler.scheduled_spans()[0].1;
        assert_eq!(second_stop, first_stop);
    }

    #[test]
    fn test_cursor_reanchors_after_interrupt() {
        let scheduler = test_scheduler();
        scheduler.enqueue(vec![0.1; 10000]);
        assert_eq!(scheduler.cursor(), 10000);

        let mut out = vec![0.0f32; 500];
        scheduler.mix_into(&mut out);

        scheduler.fade_out_all();
        assert_eq!(scheduler.cursor(), 0);

        // Next enqueue starts at the clock's current position, not frame 0.
        scheduler.enqueue(vec![0.1; 100]);
        let spans = scheduler.scheduled_spans();
        assert_eq!(spans.last().unwrap().0, 500);
    }

    #[tokio::test]
    async fn test_interrupt_clears_live_set_after_grace() {
        let mut config = AppConfig::default();
        config.audio.fade_out_ms = 10;
        config.audio.clear_grace_ms = 10;
        let playback = PlaybackScheduler::new(&config.audio);

        playback.enqueue(vec![0.5; 24000]).await;
        playback.enqueue(vec![0.5; 24000]).await;
        assert_eq!(playback.scheduler().live_units(), 2);

        playback.interrupt();
        // Without a device the clock never advances, so only the deferred
        // clear can empty the live set.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(playback.scheduler().live_units(), 0);
        assert_eq!(playback.scheduler().cursor(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_twice_in_rapid_succession() {
        let config = AppConfig::default();
        let playback = PlaybackScheduler::new(&config.audio);

        playback.enqueue(vec![0.5; 1000]).await;
        playback.interrupt();
        playback.interrupt();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(playback.scheduler().live_units(), 0);
    }

    #[tokio::test]
    async fn test_close_device_is_idempotent() {
        let config = AppConfig::default();
        let playback = PlaybackScheduler::new(&config.audio);
        // Never opened; closing repeatedly must not panic or block.
        playback.close_device();
        playback.close_device();
    }
}
