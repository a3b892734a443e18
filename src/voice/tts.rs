//! Speech synthesis
//!
//! Streamed response text is grouped into speakable phrases by the
//! [`PhraseChunker`] and spoken by a dedicated worker thread that drains a
//! FIFO phrase queue. The synthesis engine has no mid-utterance stop
//! primitive, so `stop()` means "drop unplayed queue items": the unit already
//! handed to the engine finishes, nothing queued behind it is spoken.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;

/// Characters allowed through to the synthesis engine
static SPEAKABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\w\s.,!?;:'"()-]"#).expect("static regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Strip symbols the engine would read aloud and collapse whitespace
pub fn clean_text_for_speech(text: &str) -> String {
    let cleaned = SPEAKABLE.replace_all(text, "");
    WHITESPACE.replace_all(&cleaned, " ").trim().to_string()
}

/// Append-only text accumulator that emits speakable phrases.
///
/// A phrase is flushed when the sentence-boundary regex matches and the
/// accumulated prefix exceeds the minimum length; shorter prefixes wait for
/// more text so the first word of a response is not spoken in isolation.
pub struct PhraseChunker {
    buffer: String,
    boundary: Regex,
    min_chars: usize,
}

impl PhraseChunker {
    pub fn new(config: &VoiceConfig) -> Result<Self> {
        let boundary = Regex::new(&config.sentence_boundary_regex)
            .context("Invalid sentence boundary regex")?;
        Ok(Self {
            buffer: String::new(),
            boundary,
            min_chars: config.chunk_chars_min,
        })
    }

    /// Append streamed text and return any phrases that became speakable
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut phrases = Vec::new();
        loop {
            // Take the first boundary whose prefix clears the minimum length;
            // short leading sentences ride along with the next one.
            let mut split_at = None;
            for m in self.boundary.find_iter(&self.buffer) {
                if self.buffer[..m.end()].trim().len() > self.min_chars {
                    split_at = Some(m.end());
                    break;
                }
            }
            let Some(end) = split_at else { break };
            let phrase = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            phrases.push(phrase);
        }
        phrases
    }

    /// Emit whatever remains in the buffer (stream completed or cancelled)
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// Discard buffered text without speaking it (barge-in)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Boundary to the acoustic synthesis engine. Blocking: returns once the
/// phrase has been spoken (or handed to the device).
pub trait SpeechSynthesizer: Send + Sync {
    fn speak(&self, text: &str) -> Result<()>;
}

/// Degraded-mode synthesizer: logs instead of speaking
pub struct NullSynthesizer;

impl SpeechSynthesizer for NullSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        info!("(silent) {text}");
        Ok(())
    }
}

/// Synthesizer shelling out to a system TTS command (espeak on Linux, say on
/// macOS). Blocks until playback finishes.
pub struct CommandSynthesizer {
    program: String,
}

impl CommandSynthesizer {
    pub fn new() -> Self {
        let program = if cfg!(target_os = "macos") { "say" } else { "espeak" };
        Self {
            program: program.to_string(),
        }
    }
}

impl Default for CommandSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        let status = std::process::Command::new(&self.program)
            .arg(text)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .with_context(|| format!("Failed to run {}", self.program))?;
        if !status.success() {
            anyhow::bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }
}

/// Piper subprocess synthesizer: raw PCM from piper played through the
/// process-wide output sink.
#[cfg(feature = "voice")]
pub struct PiperSynthesizer {
    piper_bin: String,
    model: std::path::PathBuf,
    output: crate::voice::audio::AudioOutput,
}

/// Piper voices emit 16-bit PCM at this rate
#[cfg(feature = "voice")]
const PIPER_SAMPLE_RATE: u32 = 22050;

#[cfg(feature = "voice")]
impl PiperSynthesizer {
    pub fn new(piper_bin: &str, model: &std::path::Path) -> Result<Self> {
        Ok(Self {
            piper_bin: piper_bin.to_string(),
            model: model.to_path_buf(),
            output: crate::voice::audio::AudioOutput::new()?,
        })
    }
}

#[cfg(feature = "voice")]
impl SpeechSynthesizer for PiperSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        use std::io::Write;

        let mut child = std::process::Command::new(&self.piper_bin)
            .arg("--model")
            .arg(&self.model)
            .arg("--output-raw")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("Failed to spawn piper")?;

        child
            .stdin
            .take()
            .context("No piper stdin")?
            .write_all(text.as_bytes())
            .context("Failed to write text to piper")?;

        let output = child
            .wait_with_output()
            .context("Failed to read piper output")?;
        if !output.status.success() {
            anyhow::bail!("piper exited with {}", output.status);
        }

        let samples: Vec<i16> = output
            .stdout
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        self.output.play_pcm(&samples, PIPER_SAMPLE_RATE)?;
        self.output.sleep_until_end();
        Ok(())
    }
}

enum WorkItem {
    Phrase(String),
    Shutdown,
}

struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
}

/// Serialized speech synthesis on a dedicated worker thread.
///
/// Phrases are spoken in enqueue order; the worker is the sole writer to the
/// audio output device.
pub struct TtsWorker {
    queue: Arc<WorkQueue>,
    speaking: Arc<AtomicBool>,
    idle_rx: tokio::sync::watch::Receiver<bool>,
    done_rx: Mutex<std::sync::mpsc::Receiver<()>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TtsWorker {
    pub fn spawn(engine: Box<dyn SpeechSynthesizer>) -> Self {
        let queue = Arc::new(WorkQueue {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let speaking = Arc::new(AtomicBool::new(false));
        let (idle_tx, idle_rx) = tokio::sync::watch::channel(true);
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let worker_queue = Arc::clone(&queue);
        let worker_speaking = Arc::clone(&speaking);
        let handle = std::thread::Builder::new()
            .name("tts-worker".to_string())
            .spawn(move || {
                tts_worker_loop(worker_queue, worker_speaking, engine, idle_tx);
                let _ = done_tx.send(());
            })
            .expect("Failed to spawn TTS worker thread");

        info!("TTS worker thread started");
        Self {
            queue,
            speaking,
            idle_rx,
            done_rx: Mutex::new(done_rx),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a phrase for synthesis. Text is cleaned first; empty results
    /// are skipped.
    pub fn enqueue(&self, phrase: &str) {
        let cleaned = clean_text_for_speech(phrase);
        if cleaned.is_empty() {
            return;
        }
        debug!("Queued for TTS: '{cleaned}'");
        if let Ok(mut items) = self.queue.items.lock() {
            items.push_back(WorkItem::Phrase(cleaned));
            self.queue.available.notify_one();
        }
    }

    /// Speak a phrase and wait until the queue has fully drained
    pub async fn speak_and_wait(&self, phrase: &str) {
        self.enqueue(phrase);
        self.wait_until_idle().await;
    }

    /// Wait for the queue to drain and the current unit to finish
    pub async fn wait_until_idle(&self) {
        let mut rx = self.idle_rx.clone();
        loop {
            if *rx.borrow() && !self.is_busy() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Barge-in: drop every unplayed phrase. The unit currently at the
    /// engine finishes on its own.
    pub fn stop(&self) {
        info!("TTS stop requested (barge-in); clearing phrase queue");
        if let Ok(mut items) = self.queue.items.lock() {
            items.retain(|item| matches!(item, WorkItem::Shutdown));
        }
    }

    /// Whether the engine is speaking right now
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Whether any phrases are still queued or being spoken
    pub fn is_busy(&self) -> bool {
        if self.speaking.load(Ordering::SeqCst) {
            return true;
        }
        self.queue
            .items
            .lock()
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Shut the worker down, waiting up to 2 seconds for it to exit
    pub fn shutdown(&self) {
        if let Ok(mut items) = self.queue.items.lock() {
            items.push_back(WorkItem::Shutdown);
            self.queue.available.notify_one();
        }

        let done = self
            .done_rx
            .lock()
            .ok()
            .map(|rx| rx.recv_timeout(Duration::from_secs(2)));
        match done {
            Some(Ok(())) => {
                if let Ok(mut slot) = self.handle.lock() {
                    if let Some(handle) = slot.take() {
                        let _ = handle.join();
                    }
                }
                info!("TTS worker thread finished");
            }
            _ => warn!("TTS worker did not exit within 2s; detaching"),
        }
    }
}

fn tts_worker_loop(
    queue: Arc<WorkQueue>,
    speaking: Arc<AtomicBool>,
    engine: Box<dyn SpeechSynthesizer>,
    idle_tx: tokio::sync::watch::Sender<bool>,
) {
    loop {
        let item = {
            let Ok(mut items) = queue.items.lock() else {
                warn!("TTS queue lock poisoned; worker exiting");
                return;
            };
            loop {
                if let Some(item) = items.pop_front() {
                    break item;
                }
                let _ = idle_tx.send(true);
                let (guard, _timeout) = match queue
                    .available
                    .wait_timeout(items, Duration::from_secs(1))
                {
                    Ok(pair) => pair,
                    Err(_) => {
                        warn!("TTS queue lock poisoned; worker exiting");
                        return;
                    }
                };
                items = guard;
            }
        };

        match item {
            WorkItem::Phrase(text) => {
                let _ = idle_tx.send(false);
                speaking.store(true, Ordering::SeqCst);
                if let Err(e) = engine.speak(&text) {
                    warn!("Synthesis engine failed to speak phrase: {e}");
                }
                speaking.store(false, Ordering::SeqCst);

                let drained = queue.items.lock().map(|q| q.is_empty()).unwrap_or(true);
                if drained {
                    let _ = idle_tx.send(true);
                }
            }
            WorkItem::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn chunker(min_chars: usize) -> PhraseChunker {
        PhraseChunker::new(&VoiceConfig {
            chunk_chars_min: min_chars,
            ..VoiceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_clean_text_strips_symbols() {
        assert_eq!(clean_text_for_speech("Hello 🎉  world!"), "Hello world!");
        assert_eq!(clean_text_for_speech("a\n\nb\tc"), "a b c");
        assert_eq!(clean_text_for_speech("***"), "");
    }

    #[test]
    fn test_chunker_emits_on_boundary() {
        let mut chunker = chunker(5);
        assert!(chunker.push("This is the first sentence").is_empty());
        let phrases = chunker.push(". And more");
        assert_eq!(phrases, vec!["This is the first sentence.".to_string()]);
        assert_eq!(chunker.flush().as_deref(), Some("And more"));
    }

    #[test]
    fn test_chunker_holds_short_phrases() {
        let mut chunker = chunker(20);
        // "Hi. " matches the boundary but is below the minimum length
        assert!(chunker.push("Hi. ").is_empty());
        let phrases = chunker.push("This continues into a longer sentence. ");
        assert_eq!(phrases.len(), 1);
        assert!(phrases[0].starts_with("Hi."));
    }

    #[test]
    fn test_chunker_token_by_token() {
        let mut chunker = chunker(5);
        let mut spoken = Vec::new();
        for token in ["Hel", "lo the", "re. ", "Second", " part. "] {
            spoken.extend(chunker.push(token));
        }
        assert_eq!(spoken, vec!["Hello there.", "Second part."]);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn test_chunker_clear_discards() {
        let mut chunker = chunker(5);
        chunker.push("unfinished text");
        chunker.clear();
        assert!(chunker.flush().is_none());
    }

    /// Records spoken phrases; optional per-phrase delay to simulate playback
    struct RecordingSynth {
        spoken: Arc<Mutex<Vec<String>>>,
        delay: Duration,
        count: Arc<AtomicUsize>,
    }

    impl SpeechSynthesizer for RecordingSynth {
        fn speak(&self, text: &str) -> Result<()> {
            std::thread::sleep(self.delay);
            self.spoken.lock().unwrap().push(text.to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recording_worker(delay: Duration) -> (TtsWorker, Arc<Mutex<Vec<String>>>) {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let synth = RecordingSynth {
            spoken: Arc::clone(&spoken),
            delay,
            count: Arc::new(AtomicUsize::new(0)),
        };
        (TtsWorker::spawn(Box::new(synth)), spoken)
    }

    #[tokio::test]
    async fn test_worker_speaks_in_fifo_order() {
        let (worker, spoken) = recording_worker(Duration::from_millis(1));
        worker.enqueue("First phrase.");
        worker.enqueue("Second phrase.");
        worker.wait_until_idle().await;
        assert_eq!(
            *spoken.lock().unwrap(),
            vec!["First phrase.".to_string(), "Second phrase.".to_string()]
        );
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_stop_clears_unplayed_queue() {
        let (worker, spoken) = recording_worker(Duration::from_millis(50));
        worker.enqueue("One that plays.");
        for i in 0..10 {
            worker.enqueue(&format!("Dropped phrase {i}."));
        }
        // Let the first phrase start, then barge in
        std::thread::sleep(Duration::from_millis(20));
        worker.stop();
        worker.wait_until_idle().await;

        let spoken = spoken.lock().unwrap();
        assert!(spoken.len() <= 2, "queue should have been cleared: {spoken:?}");
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_empty_phrases_are_skipped() {
        let (worker, spoken) = recording_worker(Duration::ZERO);
        worker.enqueue("   ");
        worker.enqueue("🎉🎉");
        worker.wait_until_idle().await;
        assert!(spoken.lock().unwrap().is_empty());
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded() {
        let (worker, _spoken) = recording_worker(Duration::ZERO);
        let start = std::time::Instant::now();
        worker.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
