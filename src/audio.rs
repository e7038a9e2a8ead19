//! Audio channel: one capture source and one playback sink behind a single handle
//!
//! Capture and playback both run on dedicated OS threads so blocking device I/O
//! never stalls the tokio runtime. Captured audio leaves the channel as a lazy
//! stream of fixed-size frames; playback audio enters it through a bounded queue
//! so a slow sink pushes back on the session.
//!
//! Only 16-bit little-endian PCM (LINEAR16) is supported.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Frames buffered between the capture thread and the encoder
const CAPTURE_QUEUE_DEPTH: usize = 32;

/// Buffers queued for the playback thread before `play` waits
const PLAYBACK_QUEUE_DEPTH: usize = 16;

/// Error type for audio device operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported sample width: {0} bytes")]
    UnsupportedSampleWidth(u16),

    #[error("Capture is not running")]
    NotCapturing,

    #[error("Frames for this capture were already taken")]
    FramesTaken,

    #[error("Playback is not running")]
    NotPlaying,

    #[error("Playback worker stopped unexpectedly")]
    PlaybackStopped,

    #[error("Audio channel is closed")]
    Closed,
}

/// PCM layout shared by capture and playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Bytes per sample
    pub sample_width: u16,
    /// Bytes per captured frame
    pub frame_size: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            sample_width: 2,
            frame_size: 3200,
        }
    }
}

/// A raw PCM buffer tagged with its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub sample_width: u16,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, format: &AudioFormat) -> Self {
        Self {
            data,
            sample_rate: format.sample_rate,
            sample_width: format.sample_width,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A device that records PCM audio.
///
/// `read` blocks until a buffer is available. Returning `Ok(0)` means the source
/// is exhausted and ends the current capture.
pub trait AudioSource: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
}

/// A device that plays PCM audio. `write` may block while the device drains.
pub trait AudioSink: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn write(&mut self, buf: &[u8]) -> Result<(), AudioError>;
    fn flush(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
}

/// Stream of captured frames for one turn
pub type FrameStream = BoxStream<'static, Result<AudioFrame, AudioError>>;

type SharedSource = Arc<Mutex<Box<dyn AudioSource>>>;
type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One running capture; its thread exits once `running` is cleared
struct Capture {
    running: Arc<AtomicBool>,
    frames: Option<mpsc::Receiver<Result<AudioFrame, AudioError>>>,
}

/// One running playback; dropping `tx` lets the worker drain and stop the sink
struct Playback {
    tx: mpsc::Sender<Vec<u8>>,
    done: oneshot::Receiver<Result<(), AudioError>>,
}

/// Capture source plus playback sink, shared across turns
pub struct AudioChannel {
    format: AudioFormat,
    volume_percent: AtomicU8,
    source: SharedSource,
    sink: SharedSink,
    capture: Mutex<Option<Capture>>,
    playback: Mutex<Option<Playback>>,
    closed: AtomicBool,
}

impl AudioChannel {
    /// Create a channel from a source and a sink.
    pub fn new(
        format: AudioFormat,
        volume_percent: u8,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> Result<Self, AudioError> {
        if format.sample_width != 2 {
            return Err(AudioError::UnsupportedSampleWidth(format.sample_width));
        }
        Ok(Self {
            format,
            volume_percent: AtomicU8::new(volume_percent.min(100)),
            source: Arc::new(Mutex::new(source)),
            sink: Arc::new(Mutex::new(sink)),
            capture: Mutex::new(None),
            playback: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn volume_percent(&self) -> u8 {
        self.volume_percent.load(Ordering::Relaxed)
    }

    pub fn set_volume_percent(&self, volume: u8) {
        let volume = volume.min(100);
        let previous = self.volume_percent.swap(volume, Ordering::Relaxed);
        if previous != volume {
            info!("Volume changed {}% -> {}%", previous, volume);
        }
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.capture).is_some()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.playback).is_some()
    }

    /// Start the source and spawn the capture thread. No-op if already recording.
    pub fn begin_capture(&self) -> Result<(), AudioError> {
        self.ensure_open()?;
        let mut slot = lock(&self.capture);
        if slot.is_some() {
            return Ok(());
        }

        lock(&self.source).start()?;

        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        spawn_capture(self.source.clone(), running.clone(), self.format, tx)?;

        *slot = Some(Capture {
            running,
            frames: Some(rx),
        });
        info!(
            "Recording started ({} Hz, {} byte frames)",
            self.format.sample_rate, self.format.frame_size
        );
        Ok(())
    }

    /// Stop the capture thread and the source. Idempotent.
    ///
    /// Waits for a read in progress to return, which can take up to one frame
    /// on a real-time device.
    pub fn end_capture(&self) -> Result<(), AudioError> {
        let Some(capture) = lock(&self.capture).take() else {
            return Ok(());
        };
        capture.running.store(false, Ordering::Release);
        lock(&self.source).stop()?;
        info!("Recording stopped");
        Ok(())
    }

    /// Take the frames of the current capture.
    ///
    /// The stream ends when capture stops or the source is exhausted. It can be
    /// taken once per `begin_capture`.
    pub fn produce_frames(&self) -> Result<FrameStream, AudioError> {
        let mut slot = lock(&self.capture);
        let capture = slot.as_mut().ok_or(AudioError::NotCapturing)?;
        let rx = capture.frames.take().ok_or(AudioError::FramesTaken)?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed())
    }

    /// Start the sink and spawn the playback thread. No-op if already playing.
    pub fn begin_playback(&self) -> Result<(), AudioError> {
        self.ensure_open()?;
        let mut slot = lock(&self.playback);
        if slot.is_some() {
            return Ok(());
        }

        lock(&self.sink).start()?;

        let (tx, rx) = mpsc::channel(PLAYBACK_QUEUE_DEPTH);
        let (done_tx, done) = oneshot::channel();
        spawn_playback(self.sink.clone(), rx, done_tx)?;

        *slot = Some(Playback { tx, done });
        info!("Playback started");
        Ok(())
    }

    /// Queue a buffer for playback, scaled to the current volume.
    ///
    /// Buffers are played in submission order. Waits only when the playback
    /// queue is full.
    pub async fn play(&self, frame: AudioFrame) -> Result<(), AudioError> {
        let tx = lock(&self.playback)
            .as_ref()
            .map(|p| p.tx.clone())
            .ok_or(AudioError::NotPlaying)?;

        let mut data = align_buf(frame.data, self.format.sample_width);
        normalize_audio_buffer(&mut data, self.volume_percent());

        tx.send(data)
            .await
            .map_err(|_| AudioError::PlaybackStopped)
    }

    /// Let queued audio finish, then flush and stop the sink. Idempotent.
    pub async fn end_playback(&self) -> Result<(), AudioError> {
        let Some(Playback { tx, done }) = lock(&self.playback).take() else {
            return Ok(());
        };
        drop(tx);

        let result = done.await.unwrap_or(Err(AudioError::PlaybackStopped));
        info!("Playback finished");
        result
    }

    /// Stop capture and detach playback without waiting.
    ///
    /// Used when a turn is torn down outside an async context. The playback
    /// worker still drains what was queued and stops the sink on its own.
    pub fn abort(&self) {
        if let Err(e) = self.end_capture() {
            warn!("Failed to stop capture during abort: {}", e);
        }
        if lock(&self.playback).take().is_some() {
            debug!("Playback detached during abort");
        }
    }

    /// Tear down both directions and refuse further use.
    pub fn close(&self) {
        self.abort();
        self.closed.store(true, Ordering::Release);
        info!("Audio channel closed");
    }

    fn ensure_open(&self) -> Result<(), AudioError> {
        if self.closed.load(Ordering::Acquire) {
            Err(AudioError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for AudioChannel {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_capture(
    source: SharedSource,
    running: Arc<AtomicBool>,
    format: AudioFormat,
    tx: mpsc::Sender<Result<AudioFrame, AudioError>>,
) -> Result<(), AudioError> {
    thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            let mut frames = 0usize;
            loop {
                let mut buf = vec![0u8; format.frame_size];
                let read = {
                    // checked under the lock so a stopped source is never read
                    let mut source = lock(&source);
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    source.read(&mut buf)
                };
                match read {
                    Ok(0) => {
                        debug!("Capture source exhausted after {} frames", frames);
                        break;
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        frames += 1;
                        if tx.blocking_send(Ok(AudioFrame::new(buf, &format))).is_err() {
                            debug!("Frame receiver dropped, ending capture");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Audio capture error: {}", e);
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_playback(
    sink: SharedSink,
    mut rx: mpsc::Receiver<Vec<u8>>,
    done: oneshot::Sender<Result<(), AudioError>>,
) -> Result<(), AudioError> {
    thread::Builder::new()
        .name("audio-playback".to_string())
        .spawn(move || {
            let mut result = Ok(());
            while let Some(buf) = rx.blocking_recv() {
                if let Err(e) = lock(&sink).write(&buf) {
                    error!("Audio playback error: {}", e);
                    result = Err(e);
                    break;
                }
            }

            let mut sink = lock(&sink);
            let finish = sink.flush().and_then(|()| sink.stop());
            let _ = done.send(result.and(finish));
        })?;
    Ok(())
}

/// Pad a buffer with silence to a whole number of samples.
pub fn align_buf(mut buf: Vec<u8>, sample_width: u16) -> Vec<u8> {
    let width = usize::from(sample_width.max(1));
    let remainder = buf.len() % width;
    if remainder != 0 {
        buf.resize(buf.len() + width - remainder, 0);
    }
    buf
}

/// Scale 16-bit samples in place by `2^(volume/100) - 1`; 100% is unity gain.
pub fn normalize_audio_buffer(buf: &mut [u8], volume_percent: u8) {
    if volume_percent >= 100 {
        return;
    }
    let scale = 2f64.powf(f64::from(volume_percent) / 100.0) - 1.0;
    let whole = buf.len() - buf.len() % 2;
    let body = &mut buf[..whole];
    let mut samples: Vec<i16> = bytemuck::pod_collect_to_vec(&body[..]);
    for sample in &mut samples {
        *sample = (f64::from(*sample) * scale) as i16;
    }
    body.copy_from_slice(bytemuck::cast_slice::<i16, u8>(&samples));
}

/// In-memory source that replays a PCM buffer from the start on every capture
pub struct MemorySource {
    pcm: Vec<u8>,
    position: usize,
    frame_delay: Option<std::time::Duration>,
    counters: Arc<DeviceCounters>,
}

/// In-memory sink that collects everything played
pub struct MemorySink {
    played: Arc<Mutex<Vec<u8>>>,
    counters: Arc<DeviceCounters>,
}

/// Start/stop bookkeeping for in-memory devices
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub starts: std::sync::atomic::AtomicUsize,
    pub stops: std::sync::atomic::AtomicUsize,
}

impl DeviceCounters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MemorySource {
    pub fn new(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            position: 0,
            frame_delay: None,
            counters: Arc::default(),
        }
    }

    /// Sleep between reads to imitate a real-time device.
    pub fn with_frame_delay(mut self, delay: std::time::Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    pub fn counters(&self) -> Arc<DeviceCounters> {
        self.counters.clone()
    }
}

impl AudioSource for MemorySource {
    fn start(&mut self) -> Result<(), AudioError> {
        self.position = 0;
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if let Some(delay) = self.frame_delay {
            thread::sleep(delay);
        }
        let remaining = &self.pcm[self.position.min(self.pcm.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            played: Arc::default(),
            counters: Arc::default(),
        }
    }

    /// Handle to the bytes played so far
    pub fn played(&self) -> Arc<Mutex<Vec<u8>>> {
        self.played.clone()
    }

    pub fn counters(&self) -> Arc<DeviceCounters> {
        self.counters.clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for MemorySink {
    fn start(&mut self) -> Result<(), AudioError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), AudioError> {
        lock(&self.played).extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
