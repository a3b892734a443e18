//! Streaming transcription
//!
//! Consumes gated capture frames and produces one final transcript per
//! `listen()` call. Each invocation runs its own small state machine:
//!
//! ```text
//! AwaitingTrigger ──speech ≥ trigger_ms──▶ InUtterance ──silence ≥ release_ms──▶ Finalizing
//!        │                                     │
//!        └──────── idle timeout ──▶ None       └──────── idle timeout ──▶ Finalizing
//! ```
//!
//! The recognizer only sees frames inside the utterance window. The loop runs
//! on a blocking worker so a barge-in can cancel it without stalling the
//! session task; cancellation discards partial state and yields no result.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SttConfig;
use crate::voice::audio::FrameQueue;
use crate::voice::vad::VoiceGate;

/// Poll granularity for the capture queue
const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Boundary to the acoustic recognition engine.
///
/// `accept_frame` returns the text of a completed segment whenever the engine
/// closes one; `flush` returns the terminal result and resets engine state.
pub trait SpeechRecognizer: Send {
    fn accept_frame(&mut self, frame: &[i16]) -> Result<Option<String>>;
    fn flush(&mut self) -> Result<String>;
}

/// Degraded-mode recognizer used when no engine is available. Produces empty
/// transcripts, which the controller reports as "no speech recognized".
pub struct NullRecognizer;

impl SpeechRecognizer for NullRecognizer {
    fn accept_frame(&mut self, _frame: &[i16]) -> Result<Option<String>> {
        Ok(None)
    }

    fn flush(&mut self) -> Result<String> {
        Ok(String::new())
    }
}

/// Vosk streaming recognizer (feature "vosk-stt", requires system libvosk)
#[cfg(feature = "vosk-stt")]
pub struct VoskRecognizer {
    recognizer: vosk::Recognizer,
}

#[cfg(feature = "vosk-stt")]
impl VoskRecognizer {
    pub fn new(model_path: &std::path::Path, sample_rate: u32) -> Result<Self> {
        let path = model_path.to_string_lossy().to_string();
        let model = vosk::Model::new(&path)
            .ok_or_else(|| anyhow::anyhow!("Failed to load Vosk model from {path}"))?;
        let recognizer = vosk::Recognizer::new(&model, sample_rate as f32)
            .ok_or_else(|| anyhow::anyhow!("Failed to create Vosk recognizer"))?;
        Ok(Self { recognizer })
    }
}

#[cfg(feature = "vosk-stt")]
impl SpeechRecognizer for VoskRecognizer {
    fn accept_frame(&mut self, frame: &[i16]) -> Result<Option<String>> {
        match self.recognizer.accept_waveform(frame) {
            vosk::DecodingState::Finalized => {
                let text = self
                    .recognizer
                    .result()
                    .single()
                    .map(|r| r.text.to_string())
                    .unwrap_or_default();
                Ok((!text.is_empty()).then_some(text))
            }
            vosk::DecodingState::Running => Ok(None),
            vosk::DecodingState::Failed => anyhow::bail!("Vosk decoding failed"),
        }
    }

    fn flush(&mut self) -> Result<String> {
        let text = self
            .recognizer
            .final_result()
            .single()
            .map(|r| r.text.to_string())
            .unwrap_or_default();
        self.recognizer.reset();
        Ok(text)
    }
}

/// Cancellation flag shared between the session task and the listen worker
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum ListenState {
    AwaitingTrigger,
    InUtterance,
}

/// Voice-activity-gated streaming transcriber
pub struct StreamingTranscriber {
    frames: Arc<FrameQueue>,
    gate: Arc<VoiceGate>,
    recognizer: Arc<Mutex<Box<dyn SpeechRecognizer>>>,
    trigger_threshold_ms: u64,
    release_threshold_ms: u64,
    idle_timeout_ms: u64,
    sample_rate: u32,
}

impl StreamingTranscriber {
    pub fn new(
        config: &SttConfig,
        frames: Arc<FrameQueue>,
        gate: Arc<VoiceGate>,
        recognizer: Box<dyn SpeechRecognizer>,
    ) -> Self {
        Self {
            frames,
            gate,
            recognizer: Arc::new(Mutex::new(recognizer)),
            trigger_threshold_ms: config.trigger_threshold_ms,
            release_threshold_ms: config.release_threshold_ms,
            idle_timeout_ms: config.idle_timeout_ms,
            sample_rate: config.sample_rate,
        }
    }

    /// Listen for one utterance and return its transcript.
    ///
    /// Returns `Ok(None)` when no speech was detected before the idle
    /// timeout, or when `cancel` fires mid-utterance. Recognizer errors are
    /// fatal to this invocation only.
    pub async fn listen(&self, cancel: CancelFlag) -> Result<Option<String>> {
        let frames = Arc::clone(&self.frames);
        let gate = Arc::clone(&self.gate);
        let recognizer = Arc::clone(&self.recognizer);
        let trigger_ms = self.trigger_threshold_ms;
        let release_ms = self.release_threshold_ms;
        let idle_timeout = Duration::from_millis(self.idle_timeout_ms);
        let sample_rate = self.sample_rate;

        tokio::task::spawn_blocking(move || {
            listen_blocking(
                &frames,
                &gate,
                &recognizer,
                cancel,
                trigger_ms,
                release_ms,
                idle_timeout,
                sample_rate,
            )
        })
        .await
        .map_err(|e| anyhow::anyhow!("Transcription worker panicked: {e}"))?
    }
}

#[allow(clippy::too_many_arguments)]
fn listen_blocking(
    frames: &FrameQueue,
    gate: &VoiceGate,
    recognizer: &Mutex<Box<dyn SpeechRecognizer>>,
    cancel: CancelFlag,
    trigger_ms: u64,
    release_ms: u64,
    idle_timeout: Duration,
    sample_rate: u32,
) -> Result<Option<String>> {
    let mut rec = recognizer
        .lock()
        .map_err(|_| anyhow::anyhow!("Recognizer lock poisoned"))?;

    // Stale frames from before this invocation must not leak into it
    frames.clear();
    gate.reset();

    let started = Instant::now();
    let mut state = ListenState::AwaitingTrigger;
    let mut speech_ms: u64 = 0;
    let mut silence_ms: u64 = 0;
    let mut transcript = String::new();

    let result = loop {
        if cancel.is_cancelled() {
            debug!("Transcription cancelled; discarding partial state");
            let _ = rec.flush();
            return Ok(None);
        }

        let frame = match frames.pop_timeout(POP_TIMEOUT) {
            Some(frame) => frame,
            None => {
                if started.elapsed() >= idle_timeout {
                    break matches!(state, ListenState::InUtterance);
                }
                continue;
            }
        };

        let frame_ms = 1000 * frame.len() as u64 / sample_rate as u64;

        if gate.classify(&frame) {
            speech_ms += frame_ms;
            silence_ms = 0;

            if matches!(state, ListenState::AwaitingTrigger) && speech_ms >= trigger_ms {
                debug!("Utterance opened after {speech_ms}ms of speech");
                state = ListenState::InUtterance;
            }

            if matches!(state, ListenState::InUtterance) {
                if let Some(segment) = rec.accept_frame(&frame)? {
                    if !transcript.is_empty() {
                        transcript.push(' ');
                    }
                    transcript.push_str(&segment);
                }
            }
        } else {
            silence_ms += frame_ms;
            speech_ms = 0;

            if matches!(state, ListenState::InUtterance) && silence_ms >= release_ms {
                debug!("End of utterance after {silence_ms}ms of silence");
                break true;
            }
        }

        if started.elapsed() >= idle_timeout {
            break matches!(state, ListenState::InUtterance);
        }
    };

    if !result {
        // Idle timeout with no speech; reset the engine for the next call
        let _ = rec.flush();
        return Ok(None);
    }

    let tail = rec.flush()?;
    if !tail.is_empty() {
        if !transcript.is_empty() {
            transcript.push(' ');
        }
        transcript.push_str(&tail);
    }

    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        info!("Utterance closed with empty transcript");
        Ok(None)
    } else {
        info!("Transcribed: {transcript}");
        Ok(Some(transcript))
    }
}

/// Build a recognizer from config: Vosk when compiled in and a model path is
/// set, otherwise the degraded null engine.
pub fn recognizer_from_config(config: &SttConfig) -> Box<dyn SpeechRecognizer> {
    #[cfg(feature = "vosk-stt")]
    if let Some(ref path) = config.vosk_model_path {
        match VoskRecognizer::new(path, config.sample_rate) {
            Ok(rec) => return Box::new(rec),
            Err(e) => warn!("Vosk recognizer unavailable: {e}; using null recognizer"),
        }
    }

    #[cfg(not(feature = "vosk-stt"))]
    if config.vosk_model_path.is_some() {
        warn!("Vosk model configured but the vosk-stt feature is not compiled in");
    }

    warn!("No speech recognizer available; transcripts will be empty");
    Box::new(NullRecognizer)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted recognizer: emits one segment per N accepted frames, plus a
    /// fixed flush tail.
    struct ScriptedRecognizer {
        frames_seen: usize,
        segment_every: usize,
        segment_text: String,
        flush_text: String,
    }

    impl ScriptedRecognizer {
        fn new(segment_every: usize, segment: &str, tail: &str) -> Self {
            Self {
                frames_seen: 0,
                segment_every,
                segment_text: segment.to_string(),
                flush_text: tail.to_string(),
            }
        }
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn accept_frame(&mut self, _frame: &[i16]) -> Result<Option<String>> {
            self.frames_seen += 1;
            if self.segment_every > 0 && self.frames_seen % self.segment_every == 0 {
                Ok(Some(self.segment_text.clone()))
            } else {
                Ok(None)
            }
        }

        fn flush(&mut self) -> Result<String> {
            Ok(std::mem::take(&mut self.flush_text))
        }
    }

    fn test_config() -> SttConfig {
        SttConfig {
            trigger_threshold_ms: 30,
            release_threshold_ms: 30,
            idle_timeout_ms: 500,
            vad_enabled: false, // gate fails open: every frame is speech
            ..SttConfig::default()
        }
    }

    fn speech_frame() -> Vec<i16> {
        vec![16000; 160] // 10ms at 16kHz
    }

    fn transcriber_with(
        config: &SttConfig,
        rec: Box<dyn SpeechRecognizer>,
    ) -> (StreamingTranscriber, Arc<FrameQueue>) {
        let frames = Arc::new(FrameQueue::new(256));
        let gate = Arc::new(VoiceGate::new(config.vad_enabled));
        let t = StreamingTranscriber::new(config, Arc::clone(&frames), gate, rec);
        (t, frames)
    }

    #[tokio::test]
    async fn test_transcript_from_segments_and_flush() {
        let config = test_config();
        let (transcriber, frames) =
            transcriber_with(&config, Box::new(ScriptedRecognizer::new(10, "hello", "world")));

        let handle = tokio::spawn(async move {
            transcriber.listen(CancelFlag::new()).await
        });

        // Let the worker start (it clears stale frames on entry), then feed
        // 20 speech frames (200ms) and silence until the idle timeout.
        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..20 {
            frames.push(speech_frame());
        }

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_no_speech_returns_none() {
        // Gate enabled and fed only silence: trigger never fires
        let config = SttConfig {
            vad_enabled: true,
            idle_timeout_ms: 300,
            ..test_config()
        };
        let (transcriber, frames) =
            transcriber_with(&config, Box::new(ScriptedRecognizer::new(1, "x", "y")));

        let handle = tokio::spawn(async move {
            transcriber.listen(CancelFlag::new()).await
        });
        for _ in 0..10 {
            frames.push(vec![0; 160]);
        }

        let result = handle.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_discards_partial_state() {
        let config = SttConfig {
            idle_timeout_ms: 10_000,
            ..test_config()
        };
        let (transcriber, frames) =
            transcriber_with(&config, Box::new(ScriptedRecognizer::new(5, "partial", "tail")));

        let cancel = CancelFlag::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { transcriber.listen(cancel_clone).await });

        for _ in 0..10 {
            frames.push(speech_frame());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_empty_flush_yields_none() {
        let config = test_config();
        let (transcriber, frames) =
            transcriber_with(&config, Box::new(ScriptedRecognizer::new(0, "", "")));

        let handle = tokio::spawn(async move {
            transcriber.listen(CancelFlag::new()).await
        });
        for _ in 0..10 {
            frames.push(speech_frame());
        }

        let result = handle.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_recognizer_error_fails_invocation_only() {
        struct FailingRecognizer;
        impl SpeechRecognizer for FailingRecognizer {
            fn accept_frame(&mut self, _f: &[i16]) -> Result<Option<String>> {
                anyhow::bail!("engine exploded")
            }
            fn flush(&mut self) -> Result<String> {
                Ok(String::new())
            }
        }

        let config = test_config();
        let (transcriber, frames) = transcriber_with(&config, Box::new(FailingRecognizer));

        let handle = tokio::spawn(async move {
            transcriber.listen(CancelFlag::new()).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..10 {
            frames.push(speech_frame());
        }

        assert!(handle.await.unwrap().is_err());
    }
}
