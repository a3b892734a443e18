//! Audio I/O plumbing
//!
//! Capture runs on a cpal callback thread and hands fixed-size PCM frames to
//! the transcription worker through a bounded [`FrameQueue`]. On overflow the
//! oldest frame is dropped so capture never blocks. Playback goes through a
//! single rodio sink; the synthesis worker is the only writer to it.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[cfg(feature = "voice")]
use anyhow::{Context, Result};
#[cfg(feature = "voice")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
#[cfg(feature = "voice")]
use tracing::{error, info};
use tracing::warn;

/// Default capture sample rate (16kHz, what the recognizers expect)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Default mono channel count
pub const DEFAULT_CHANNELS: u16 = 1;

/// Bounded queue of capture frames shared between the capture callback and
/// the transcription worker. Push drops the oldest frame when full.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Vec<i16>>>,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push a frame, dropping the oldest one on overflow. Capture must never
    /// block on a slow consumer.
    pub fn push(&self, frame: Vec<i16>) {
        let Ok(mut queue) = self.inner.lock() else {
            warn!("Frame queue lock poisoned; dropping frame");
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(frame);
        self.available.notify_one();
    }

    /// Pop the next frame, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<i16>> {
        let mut queue = self.inner.lock().ok()?;
        if queue.is_empty() {
            let (guard, result) = self
                .available
                .wait_timeout_while(queue, timeout, |q| q.is_empty())
                .ok()?;
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
        queue.pop_front()
    }

    /// Drop all queued frames (new listening session)
    pub fn clear(&self) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Microphone capture feeding a [`FrameQueue`]
#[cfg(feature = "voice")]
pub struct AudioInput {
    device: cpal::Device,
    stream_config: cpal::StreamConfig,
    frame_size: usize,
}

#[cfg(feature = "voice")]
impl AudioInput {
    /// Open the default input device at the requested rate
    pub fn new(sample_rate: u32, frame_size: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("No input device available (microphone not found)")?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using input device: {}", device_name);

        let stream_config = cpal::StreamConfig {
            channels: DEFAULT_CHANNELS,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
            frame_size,
        })
    }

    /// Start capturing into `queue`. The returned stream stops on drop.
    pub fn start(&self, queue: std::sync::Arc<FrameQueue>) -> Result<cpal::Stream> {
        let frame_size = self.frame_size;
        let mut pending: Vec<i16> = Vec::with_capacity(frame_size * 2);
        let err_fn = |err| error!("Audio input error: {}", err);

        let stream = match self.device.default_input_config()?.sample_format() {
            cpal::SampleFormat::F32 => self.device.build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    pending.extend(
                        data.iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                    );
                    while pending.len() >= frame_size {
                        let frame: Vec<i16> = pending.drain(..frame_size).collect();
                        queue.push(frame);
                    }
                },
                err_fn,
                None,
            )?,
            cpal::SampleFormat::I16 => self.device.build_input_stream(
                &self.stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    pending.extend_from_slice(data);
                    while pending.len() >= frame_size {
                        let frame: Vec<i16> = pending.drain(..frame_size).collect();
                        queue.push(frame);
                    }
                },
                err_fn,
                None,
            )?,
            format => anyhow::bail!("Unsupported sample format: {:?}", format),
        };

        stream.play().context("Failed to start capture stream")?;
        info!("Audio input started");
        Ok(stream)
    }

    pub fn device_name(&self) -> Result<String> {
        self.device.name().map_err(|e| anyhow::anyhow!(e))
    }
}

/// Speaker output through a single rodio sink
#[cfg(feature = "voice")]
pub struct AudioOutput {
    sink: rodio::Sink,
    _stream: rodio::OutputStream,
}

#[cfg(feature = "voice")]
impl AudioOutput {
    pub fn new() -> Result<Self> {
        let (_stream, stream_handle) = rodio::OutputStream::try_default()
            .context("Failed to create audio output stream")?;
        let sink =
            rodio::Sink::try_new(&stream_handle).context("Failed to create audio sink")?;
        Ok(Self { sink, _stream })
    }

    /// Queue PCM samples for playback
    pub fn play_pcm(&self, samples: &[i16], sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let source =
            rodio::buffer::SamplesBuffer::new(DEFAULT_CHANNELS, sample_rate, samples.to_vec());
        self.sink.append(source);
        Ok(())
    }

    /// Block until the sink drains
    pub fn sleep_until_end(&self) {
        self.sink.sleep_until_end();
    }

    pub fn is_playing(&self) -> bool {
        !self.sink.empty()
    }
}

/// Capture worker: owns the cpal stream on a dedicated thread (the stream
/// handle is not `Send`, and capture must outlive any one listen call).
#[cfg(feature = "voice")]
pub struct CaptureHandle {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(feature = "voice")]
impl CaptureHandle {
    pub fn stop(&mut self) {
        self.stop
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(feature = "voice")]
impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Start microphone capture on its own thread, feeding `queue` until the
/// returned handle is stopped. Capture failure is logged and leaves the
/// queue silent; the transcriber then times out into "no speech".
#[cfg(feature = "voice")]
pub fn start_capture_thread(
    sample_rate: u32,
    frame_size: usize,
    queue: std::sync::Arc<FrameQueue>,
) -> CaptureHandle {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            let input = match AudioInput::new(sample_rate, frame_size) {
                Ok(input) => input,
                Err(e) => {
                    error!("Audio capture unavailable: {e}");
                    return;
                }
            };
            let _stream = match input.start(queue) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start audio capture: {e}");
                    return;
                }
            };
            while !thread_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }
            info!("Audio capture stopped");
        })
        .expect("Failed to spawn audio capture thread");

    CaptureHandle {
        stop,
        handle: Some(handle),
    }
}
