//! Audio pipeline for one voice session
//!
//! Decodes a media source through an external ffmpeg process, applies
//! volume scaling, Opus-encodes one 20ms frame at a time, and drives the
//! voice transport from a dedicated real-time thread.
//!
//! ## Frame Flow
//!
//! 1. `play(url)` spawns ffmpeg decoding the source to raw 48kHz stereo
//!    s16le PCM on its stdout
//! 2. The send thread reads exactly one 3840-byte frame per iteration
//! 3. Volume scaling (integer percent, clamped to i16 range)
//! 4. Opus encode, then `VoiceTransport::send_audio_frame`
//! 5. Sleep until the absolute 20ms deadline, then advance it
//!
//! The absolute deadline is what keeps an unbounded session drift-free:
//! encode or I/O jitter on one frame never shifts the schedule of the
//! frames after it.

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use minstrel_common::voice::{
    EncoderBitrate, PCM_FRAME_SAMPLES, PCM_FRAME_SIZE, VOICE_FRAME_DURATION_MS, VOICE_SAMPLE_RATE,
};

use crate::error::PipelineError;
use crate::transport::VoiceTransport;

// =============================================================================
// Constants
// =============================================================================

/// Maximum encoded frame size in bytes
///
/// At 128 kbps with 20ms frames: 128000 * 0.020 / 8 = 320 bytes typical.
/// Opus is not strictly constant-bitrate, so we allow generous headroom.
const MAX_ENCODED_FRAME_SIZE: usize = 1024;

/// How long the send thread sleeps between pause-flag checks
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default volume in integer percent
const DEFAULT_VOLUME: u32 = 100;

/// Maximum volume in integer percent (2x amplification)
const MAX_VOLUME: u32 = 200;

// =============================================================================
// Playback Configuration
// =============================================================================

/// Configuration for the audio pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Opus encoder bitrate preset
    pub bitrate: EncoderBitrate,
    /// Path to the ffmpeg executable
    pub ffmpeg_path: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            bitrate: EncoderBitrate::default(),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

// =============================================================================
// Playback State
// =============================================================================

/// State of the audio pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No playback; no subprocess or send thread exists
    Idle,
    /// `play()` accepted and is wiring up the subprocess and thread
    Starting,
    /// The send thread is delivering frames
    Playing,
    /// The send thread is parked; no frames are delivered
    Paused,
    /// `stop()` was requested and the send thread is winding down
    Stopping,
}

// =============================================================================
// Voice Events
// =============================================================================

/// Events emitted to the session controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    /// The speaking indicator should be toggled (play/pause/resume/stop)
    SpeakingChanged(bool),
    /// The track ended on its own; not sent for an explicit `stop()`
    TrackEnded,
    /// The send loop ended because of a read or encode error
    PlaybackError(String),
}

// =============================================================================
// Shared Control Block
// =============================================================================

/// Fields shared between caller threads and the send thread
struct Control {
    /// Pipeline state, guarded for multi-field transitions
    state: Mutex<PlaybackState>,
    /// Cancellation token checked by the send loop each iteration
    stop_requested: AtomicBool,
    /// Pause flag observed by the send loop each iteration
    paused: AtomicBool,
    /// Volume in integer percent [0, 200]; one-frame-late reads are fine
    volume: AtomicU32,
    /// Frames handed to the encoder this playback (dropped sends included)
    frames_sent: AtomicU64,
    /// Frames that never reached the wire (transport not ready or send failed)
    frames_dropped: AtomicU64,
}

impl Control {
    fn new() -> Self {
        Self {
            state: Mutex::new(PlaybackState::Idle),
            stop_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            volume: AtomicU32::new(DEFAULT_VOLUME),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> PlaybackState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: PlaybackState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }
}

// =============================================================================
// Audio Pipeline
// =============================================================================

/// Audio pipeline for one voice session
///
/// Created once per logical voice connection. At most one send thread is
/// active at any time; `play()` while active performs a full synchronous
/// stop of the previous track first.
pub struct AudioPipeline {
    control: Arc<Control>,
    transport: Arc<Mutex<VoiceTransport>>,
    events: Sender<VoiceEvent>,
    config: PlaybackConfig,
    /// Decoder subprocess, shared so `stop()` can kill it to unblock the
    /// send thread's read
    subprocess: Arc<Mutex<Option<Child>>>,
    /// Join handle for the send thread
    thread: Option<JoinHandle<()>>,
    /// Media reference of the current/last playback
    source_url: Option<String>,
}

impl AudioPipeline {
    /// Create a pipeline driving the given transport
    ///
    /// Returns the pipeline and the receiver for its [`VoiceEvent`]s.
    pub fn new(
        transport: Arc<Mutex<VoiceTransport>>,
        config: PlaybackConfig,
    ) -> (Self, Receiver<VoiceEvent>) {
        let (events, event_rx) = unbounded();

        (
            Self {
                control: Arc::new(Control::new()),
                transport,
                events,
                config,
                subprocess: Arc::new(Mutex::new(None)),
                thread: None,
                source_url: None,
            },
            event_rx,
        )
    }

    /// Start playing a media source
    ///
    /// Spawns the ffmpeg decoder and the dedicated send thread. If a track
    /// is already active it is stopped synchronously first (its TrackEnded
    /// event is suppressed). On failure the pipeline stays `Idle` and a
    /// retry is safe.
    pub fn play(&mut self, url: &str) -> Result<(), PipelineError> {
        if self.control.state() != PlaybackState::Idle {
            self.stop();
        }

        let encoder = create_encoder(self.config.bitrate)?;

        let mut child =
            spawn_decoder(&self.config.ffmpeg_path, url).map_err(PipelineError::Spawn)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PipelineError::Spawn(io::Error::other("decoder stdout was not captured"))
        })?;

        *self.subprocess.lock().expect("subprocess lock poisoned") = Some(child);
        self.source_url = Some(url.to_string());

        self.begin(Box::new(stdout), encoder)
    }

    /// Transition to `Playing` and start the send thread
    fn begin(
        &mut self,
        source: Box<dyn Read + Send>,
        encoder: opus::Encoder,
    ) -> Result<(), PipelineError> {
        self.control.set_state(PlaybackState::Starting);
        self.control.stop_requested.store(false, Ordering::SeqCst);
        self.control.paused.store(false, Ordering::SeqCst);
        self.control.frames_sent.store(0, Ordering::SeqCst);
        self.control.frames_dropped.store(0, Ordering::SeqCst);

        let worker = Worker {
            control: Arc::clone(&self.control),
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
            subprocess: Arc::clone(&self.subprocess),
        };

        // Publish Playing before the thread exists: a source that ends
        // instantly lets the worker reach its Idle store right away, and
        // that store must not be overwritten by this thread afterwards.
        self.control.set_state(PlaybackState::Playing);
        let _ = self.events.send(VoiceEvent::SpeakingChanged(true));

        let handle = std::thread::Builder::new()
            .name("minstrel voice send".to_string())
            .spawn(move || worker.run(source, encoder));

        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                // Undo the half-start so a retry sees a clean pipeline
                if let Some(mut child) =
                    self.subprocess.lock().expect("subprocess lock poisoned").take()
                {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                self.control.set_state(PlaybackState::Idle);
                let _ = self.events.send(VoiceEvent::SpeakingChanged(false));
                Err(PipelineError::Spawn(e))
            }
        }
    }

    /// Stop playback and wait for the send thread to finish
    ///
    /// Kills the decoder subprocess to unblock the thread's read, then
    /// joins it. The thread's TrackEnded notification is suppressed.
    /// No-op when already `Idle`.
    pub fn stop(&mut self) {
        let was_active = {
            let mut state = self.control.state.lock().expect("state lock poisoned");
            if *state == PlaybackState::Idle {
                false
            } else {
                *state = PlaybackState::Stopping;
                true
            }
        };

        if was_active {
            self.control.stop_requested.store(true, Ordering::SeqCst);
            if let Some(child) = self
                .subprocess
                .lock()
                .expect("subprocess lock poisoned")
                .as_mut()
            {
                let _ = child.kill();
            }
        }

        // Joining a finished thread is immediate, so this is safe (and
        // keeps the handle from leaking) even when the track already
        // ended on its own.
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Pause playback; only takes effect from `Playing`
    pub fn pause(&self) {
        let mut state = self.control.state.lock().expect("state lock poisoned");
        if *state != PlaybackState::Playing {
            return;
        }
        *state = PlaybackState::Paused;
        self.control.paused.store(true, Ordering::SeqCst);
        let _ = self.events.send(VoiceEvent::SpeakingChanged(false));
    }

    /// Resume playback; only takes effect from `Paused`
    pub fn resume(&self) {
        let mut state = self.control.state.lock().expect("state lock poisoned");
        if *state != PlaybackState::Paused {
            return;
        }
        *state = PlaybackState::Playing;
        self.control.paused.store(false, Ordering::SeqCst);
        let _ = self.events.send(VoiceEvent::SpeakingChanged(true));
    }

    /// Set the volume in integer percent, clamped to [0, 200]
    ///
    /// Takes effect on the next frame.
    pub fn set_volume(&self, volume: u32) {
        self.control
            .volume
            .store(volume.min(MAX_VOLUME), Ordering::Relaxed);
    }

    /// Current volume in integer percent
    pub fn volume(&self) -> u32 {
        self.control.volume.load(Ordering::Relaxed)
    }

    /// Current pipeline state
    pub fn state(&self) -> PlaybackState {
        self.control.state()
    }

    /// Frames emitted during the current/last playback
    pub fn frames_sent(&self) -> u64 {
        self.control.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames of the current/last playback that never reached the wire
    pub fn frames_dropped(&self) -> u64 {
        self.control.frames_dropped.load(Ordering::Relaxed)
    }

    /// Media reference of the current/last playback
    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        // Never leak a send thread or a decoder subprocess
        self.stop();
    }
}

// =============================================================================
// Send Thread
// =============================================================================

/// State moved onto the dedicated send thread
struct Worker {
    control: Arc<Control>,
    transport: Arc<Mutex<VoiceTransport>>,
    events: Sender<VoiceEvent>,
    subprocess: Arc<Mutex<Option<Child>>>,
}

impl Worker {
    /// The real-time encode/send loop
    fn run(self, mut source: Box<dyn Read + Send>, mut encoder: opus::Encoder) {
        let frame_duration = Duration::from_millis(VOICE_FRAME_DURATION_MS as u64);
        let mut raw = [0u8; PCM_FRAME_SIZE];
        let mut pcm = [0i16; PCM_FRAME_SAMPLES];
        let mut encoded = [0u8; MAX_ENCODED_FRAME_SIZE];

        let mut deadline = Instant::now();
        let mut reseed_deadline = false;
        let mut warned_not_ready = false;

        loop {
            if self.control.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            if self.control.paused.load(Ordering::SeqCst) {
                std::thread::sleep(PAUSE_POLL_INTERVAL);
                // The schedule of frames after the pause starts fresh;
                // time spent paused must not be "caught up".
                reseed_deadline = true;
                continue;
            }

            if reseed_deadline {
                deadline = Instant::now();
                reseed_deadline = false;
            }

            match read_frame(source.as_mut(), &mut raw) {
                FrameRead::Frame => {}
                FrameRead::End => break,
                FrameRead::Error(e) => {
                    eprintln!("Playback: decoder read error: {}", e);
                    let _ = self
                        .events
                        .send(VoiceEvent::PlaybackError(format!("read error: {}", e)));
                    break;
                }
            }

            for (sample, bytes) in pcm.iter_mut().zip(raw.chunks_exact(2)) {
                *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            }

            let volume = self.control.volume.load(Ordering::Relaxed);
            if volume != DEFAULT_VOLUME {
                apply_volume(&mut pcm, volume);
            }

            let encoded_len = match encoder.encode(&pcm, &mut encoded) {
                Ok(len) => len,
                Err(e) => {
                    eprintln!("Playback: opus encode error: {}", e);
                    let _ = self
                        .events
                        .send(VoiceEvent::PlaybackError(format!("encode error: {}", e)));
                    break;
                }
            };

            {
                let mut transport = self.transport.lock().expect("transport lock poisoned");
                if transport.ready() {
                    // Best-effort UDP: a dropped packet is inaudible, so
                    // the loop keeps its cadence and only logs.
                    if let Err(e) = transport.send_audio_frame(&encoded[..encoded_len]) {
                        eprintln!("Playback: dropped frame: {}", e);
                        self.control.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    if !warned_not_ready {
                        warned_not_ready = true;
                        eprintln!("Playback: transport not ready, dropping frames");
                    }
                    self.control.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }

            // A dropped packet is not a dropped frame from the
            // pipeline's perspective.
            self.control.frames_sent.fetch_add(1, Ordering::Relaxed);

            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            deadline += frame_duration;
        }

        self.finish();
    }

    /// Wind down after the loop: silence flush, reap, state, notification
    fn finish(&self) {
        {
            let mut transport = self.transport.lock().expect("transport lock poisoned");
            if transport.ready() {
                if let Err(e) = transport.send_silence() {
                    eprintln!("Playback: silence flush failed: {}", e);
                }
            }
        }

        if let Some(mut child) = self
            .subprocess
            .lock()
            .expect("subprocess lock poisoned")
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }

        let stopped = self.control.stop_requested.load(Ordering::SeqCst);
        self.control.set_state(PlaybackState::Idle);
        let _ = self.events.send(VoiceEvent::SpeakingChanged(false));
        if !stopped {
            let _ = self.events.send(VoiceEvent::TrackEnded);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Result of reading one PCM frame from the decoder stream
enum FrameRead {
    /// A full frame is in the buffer (possibly zero-padded at EOF)
    Frame,
    /// Clean end of stream before any byte of this frame
    End,
    /// The stream failed mid-read
    Error(io::Error),
}

/// Read exactly one frame's worth of PCM, blocking until available
///
/// A short read at end-of-stream is zero-padded to the full frame so the
/// final frame keeps the exact 20ms cadence; the next call reports `End`.
fn read_frame(source: &mut dyn Read, buf: &mut [u8]) -> FrameRead {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return FrameRead::End;
                }
                buf[filled..].fill(0);
                return FrameRead::Frame;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return FrameRead::Error(e),
        }
    }
    FrameRead::Frame
}

/// Scale samples by `volume/100`, clamping to the i16 range
fn apply_volume(samples: &mut [i16], volume: u32) {
    for sample in samples.iter_mut() {
        let scaled = *sample as i32 * volume as i32 / 100;
        *sample = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Create an Opus encoder for 48kHz stereo at the configured bitrate
fn create_encoder(bitrate: EncoderBitrate) -> Result<opus::Encoder, PipelineError> {
    let mut encoder =
        opus::Encoder::new(VOICE_SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Audio)
            .map_err(PipelineError::Encoder)?;
    encoder
        .set_bitrate(opus::Bitrate::Bits(bitrate.bitrate()))
        .map_err(PipelineError::Encoder)?;
    Ok(encoder)
}

/// Spawn ffmpeg decoding `url` to raw 48kHz stereo s16le PCM on stdout
///
/// The reconnect flags make ffmpeg ride out transient network failures
/// on streamed sources. Its diagnostic output is discarded; the pipeline
/// only ever reads bytes.
fn spawn_decoder(ffmpeg_path: &str, url: &str) -> io::Result<Child> {
    Command::new(ffmpeg_path)
        .args(["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"])
        .args(["-i", url])
        .args(["-f", "s16le", "-ac", "2", "-ar", "48000", "-acodec", "pcm_s16le"])
        .args(["-loglevel", "quiet"])
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
}

// Test-only entry point that bypasses the ffmpeg spawn
#[cfg(test)]
impl AudioPipeline {
    /// Start playback from an in-memory source (test-only)
    fn play_source(&mut self, source: Box<dyn Read + Send>) -> Result<(), PipelineError> {
        if self.control.state() != PlaybackState::Idle {
            self.stop();
        }
        let encoder = create_encoder(self.config.bitrate)?;
        self.begin(source, encoder)
    }
}

// =============================================================================
// Tests
// =============================================================================
