//! Voice session controller
//!
//! The state machine tying the whole pipeline together:
//!
//! ```text
//! Idle ──trigger──▶ Listening ──transcript──▶ Thinking ──first token──▶ Speaking ──▶ Idle
//!  ▲                    │ (none)                                            │
//!  └────────────────────┴──────────────── barge-in ────────────────────────┘
//! ```
//!
//! State is mutated only from the session task. A trigger while Thinking or
//! Speaking is a barge-in: the synthesis queue is cleared, the in-flight
//! generation handle is aborted, pending confirmations are dropped, and the
//! machine settles back to Idle. Suggestions are polled only while Idle and
//! always go through the confirmation coordinator, never straight to speech.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::autonomy::{AutonomyEngine, ConfirmationCoordinator, ConfirmationIo};
use crate::brain::{Brain, GenerationHandle, StreamEvent};
use crate::config::Config;
use crate::memory::MemoryStore;
use crate::voice::tts::PhraseChunker;
use crate::voice::wake::{TriggerEvent, WakePhraseDetector};
use crate::voice::{CancelFlag, StreamingTranscriber, TtsWorker};

/// Idle-loop cadence for suggestion polling
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Session state; exactly one is active at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

/// Why the response phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseOutcome {
    Completed,
    BargedIn,
    Failed,
}

/// Dialogue I/O for the confirmation coordinator, backed by the session's
/// own synthesis worker, transcriber, and brain.
struct SessionIo {
    tts: Arc<TtsWorker>,
    transcriber: Arc<StreamingTranscriber>,
    brain: Arc<Brain>,
    dialogue_active: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl ConfirmationIo for SessionIo {
    fn dialogue_started(&self) {
        self.dialogue_active.store(true, Ordering::SeqCst);
    }

    fn dialogue_finished(&self) {
        self.dialogue_active.store(false, Ordering::SeqCst);
    }

    async fn speak(&self, text: &str) {
        self.tts.speak_and_wait(text).await;
    }

    async fn listen(&self, timeout: Duration) -> Option<String> {
        listen_with_timeout(&self.transcriber, timeout).await
    }

    async fn render(&self, combined_text: &str, context_snippets: &[String]) -> Option<String> {
        let prompt = format!(
            "Provide a concise, helpful suggestion given this context and user signals: {combined_text}"
        );
        match self.brain.generate(&prompt, context_snippets).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!("Concise rendering failed: {e}");
                None
            }
        }
    }
}

/// Listen with a hard timeout; on expiry the worker is cancelled and the
/// result is None rather than an error.
async fn listen_with_timeout(
    transcriber: &StreamingTranscriber,
    timeout: Duration,
) -> Option<String> {
    let cancel = CancelFlag::new();
    let listen = transcriber.listen(cancel.clone());
    match tokio::time::timeout(timeout, listen).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!("Transcription failed: {e}");
            None
        }
        Err(_) => {
            cancel.cancel();
            None
        }
    }
}

/// Top-level controller owning the session state machine
pub struct VoiceSessionController {
    config: Config,
    state: Arc<Mutex<VoiceState>>,
    transcriber: Arc<StreamingTranscriber>,
    tts: Arc<TtsWorker>,
    brain: Arc<Brain>,
    memory: Option<Arc<MemoryStore>>,
    autonomy: AutonomyEngine,
    confirmation: Arc<ConfirmationCoordinator>,
    wake_detector: WakePhraseDetector,
    dialogue_active: Arc<AtomicBool>,
}

impl VoiceSessionController {
    pub fn new(
        config: Config,
        transcriber: Arc<StreamingTranscriber>,
        tts: Arc<TtsWorker>,
        brain: Arc<Brain>,
        memory: Option<Arc<MemoryStore>>,
    ) -> Self {
        let dialogue_active = Arc::new(AtomicBool::new(false));
        let io = Arc::new(SessionIo {
            tts: Arc::clone(&tts),
            transcriber: Arc::clone(&transcriber),
            brain: Arc::clone(&brain),
            dialogue_active: Arc::clone(&dialogue_active),
        });
        let confirmation = ConfirmationCoordinator::new(&config.confirmation, io);
        let autonomy = AutonomyEngine::new(&config.autonomy, memory.clone());
        let wake_detector = WakePhraseDetector::new(&config.wake);

        Self {
            config,
            state: Arc::new(Mutex::new(VoiceState::Idle)),
            transcriber,
            tts,
            brain,
            memory,
            autonomy,
            confirmation,
            wake_detector,
            dialogue_active,
        }
    }

    /// Current state. Reads are allowed from any task; writes happen only on
    /// the session task.
    pub fn state(&self) -> VoiceState {
        self.state.lock().map(|s| *s).unwrap_or(VoiceState::Idle)
    }

    fn set_state(&self, new_state: VoiceState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != new_state {
                info!("State changed to {:?}", new_state);
                *state = new_state;
            }
        }
    }

    /// Run the session until the trigger channel closes
    pub async fn run(&mut self, mut trigger_rx: mpsc::Receiver<TriggerEvent>) -> Result<()> {
        self.autonomy.start();
        self.autonomy.resume();
        info!("Voice session ready");

        loop {
            let Some(event) = self.idle_phase(&mut trigger_rx).await else {
                break;
            };
            debug!("Trigger received: {:?}", event.source);

            // Entering a foreground interaction
            self.autonomy.pause();
            self.confirmation.clear_pending();
            self.confirmation.update_activity();
            self.set_state(VoiceState::Listening);

            match self.listen_phase(&mut trigger_rx).await {
                Some(text) => {
                    // The suggestion engine sees every transcript, whatever
                    // the turn's outcome
                    self.autonomy.update_user_input(&text);
                    self.confirmation.update_activity();
                    if let Some(ref memory) = self.memory {
                        if let Err(e) = memory.store_message("user", &text).await {
                            warn!("Failed to store user message: {e}");
                        }
                    }

                    self.respond_phase(&text, &mut trigger_rx).await;
                }
                None => {
                    info!("No speech recognized");
                }
            }

            self.set_state(VoiceState::Idle);
            self.autonomy.resume();
        }

        self.shutdown().await;
        Ok(())
    }

    /// Idle: wait for a trigger while polling the suggestion queue and,
    /// when enabled, running the passive wake listener.
    async fn idle_phase(
        &self,
        trigger_rx: &mut mpsc::Receiver<TriggerEvent>,
    ) -> Option<TriggerEvent> {
        let mut poll = tokio::time::interval(IDLE_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut wake_task: Option<(CancelFlag, tokio::task::JoinHandle<Result<Option<String>>>)> =
            None;

        loop {
            // Passive wake listening owns the mic only when nothing else
            // does: not during confirmation dialogues, not while speaking.
            let may_listen = self.config.wake.passive_enabled
                && !self.dialogue_active()
                && !self.tts.is_busy();

            if may_listen && wake_task.is_none() {
                let cancel = CancelFlag::new();
                let transcriber = Arc::clone(&self.transcriber);
                let flag = cancel.clone();
                let task = tokio::spawn(async move { transcriber.listen(flag).await });
                wake_task = Some((cancel, task));
            } else if !may_listen {
                if let Some((cancel, task)) = wake_task.take() {
                    cancel.cancel();
                    let _ = task.await;
                }
            }

            if let Some((cancel, mut task)) = wake_task.take() {
                tokio::select! {
                    event = trigger_rx.recv() => {
                        cancel.cancel();
                        let _ = task.await;
                        return event;
                    }

                    result = &mut task => {
                        match result {
                            Ok(Ok(Some(text))) if self.wake_detector.matches(&text) => {
                                info!("Wake phrase detected");
                                return Some(TriggerEvent::wake_phrase());
                            }
                            Ok(Ok(_)) => {} // silence or unrelated speech
                            Ok(Err(e)) => debug!("Passive wake listen failed: {e}"),
                            Err(e) => debug!("Passive wake task failed: {e}"),
                        }
                    }

                    _ = poll.tick() => {
                        self.poll_suggestions();
                        wake_task = Some((cancel, task));
                    }
                }
            } else {
                tokio::select! {
                    event = trigger_rx.recv() => return event,
                    _ = poll.tick() => self.poll_suggestions(),
                }
            }
        }
    }

    /// Hand one queued suggestion to the confirmation coordinator, but only
    /// while the foreground is genuinely quiet.
    fn poll_suggestions(&self) {
        if self.dialogue_active() || self.tts.is_busy() {
            return;
        }
        if let Some(suggestion) = self.autonomy.pop_suggestion() {
            debug!(
                "Suggestion picked up while idle (trigger={})",
                suggestion.trigger
            );
            self.confirmation.add_suggestion(suggestion);
        }
    }

    /// Listening: one transcription attempt. Triggers are ignored so a
    /// nervous hotkey cannot restart an in-flight transcription.
    async fn listen_phase(&self, trigger_rx: &mut mpsc::Receiver<TriggerEvent>) -> Option<String> {
        let cancel = CancelFlag::new();
        let listen = self.transcriber.listen(cancel.clone());
        tokio::pin!(listen);

        loop {
            tokio::select! {
                result = &mut listen => {
                    return match result {
                        Ok(transcript) => transcript,
                        Err(e) => {
                            warn!("Transcription failed: {e}");
                            None
                        }
                    };
                }
                Some(_) = trigger_rx.recv() => {
                    debug!("Trigger while already listening; ignored");
                }
            }
        }
    }

    /// Thinking/Speaking: stream generation into the phrase chunker, watch
    /// for barge-in, flush on completion.
    async fn respond_phase(
        &self,
        prompt: &str,
        trigger_rx: &mut mpsc::Receiver<TriggerEvent>,
    ) -> ResponseOutcome {
        self.set_state(VoiceState::Thinking);

        let mut chunker = match PhraseChunker::new(&self.config.voice) {
            Ok(chunker) => chunker,
            Err(e) => {
                warn!("Phrase chunker unavailable: {e}");
                return ResponseOutcome::Failed;
            }
        };

        let mut handle: GenerationHandle = self.brain.generate_stream(prompt, &[]);
        let mut full_response = String::new();

        let outcome = loop {
            tokio::select! {
                event = handle.next_event() => {
                    match event {
                        Some(StreamEvent::Token(token)) => {
                            if self.state() != VoiceState::Speaking {
                                self.set_state(VoiceState::Speaking);
                            }
                            full_response.push_str(&token);
                            for phrase in chunker.push(&token) {
                                self.tts.enqueue(&phrase);
                            }
                        }
                        Some(StreamEvent::Done) | None => {
                            break ResponseOutcome::Completed;
                        }
                        Some(StreamEvent::Error(e)) => {
                            warn!("Generation stream failed: {e}");
                            chunker.clear();
                            self.tts.enqueue(&self.config.brain.apology_phrase);
                            break ResponseOutcome::Failed;
                        }
                    }
                }

                Some(_) = trigger_rx.recv() => {
                    self.barge_in(&handle, &mut chunker);
                    break ResponseOutcome::BargedIn;
                }
            }
        };

        if outcome == ResponseOutcome::Completed {
            // Whatever is left in the buffer is the response tail
            if let Some(rest) = chunker.flush() {
                self.tts.enqueue(&rest);
            }
            if !full_response.trim().is_empty() {
                if let Some(ref memory) = self.memory {
                    if let Err(e) = memory.store_message("assistant", &full_response).await {
                        warn!("Failed to store assistant message: {e}");
                    }
                }
            }
        }

        outcome
    }

    /// Barge-in: synthesis queue first (stops new audio fastest), then the
    /// generation handle, then pending confirmations. No drain barrier: the
    /// synthesis unit already at the engine finishes on its own.
    fn barge_in(&self, handle: &GenerationHandle, chunker: &mut PhraseChunker) {
        info!("Barge-in detected; interrupting current response");
        self.tts.stop();
        handle.abort();
        chunker.clear();
        self.confirmation.clear_pending();
    }

    fn dialogue_active(&self) -> bool {
        self.dialogue_active.load(Ordering::SeqCst)
    }

    /// Stop workers with bounded waits
    async fn shutdown(&mut self) {
        info!("Shutting down voice session");
        self.confirmation.clear_pending();
        self.autonomy.stop().await;
        self.tts.shutdown();
    }

    /// Diagnostics for the status command
    pub fn autonomy_paused(&self) -> bool {
        self.autonomy.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::providers::{GenerationProvider, ProviderChain, ProviderError};
    use crate::brain::ChatMessage;
    use crate::config::SttConfig;
    use crate::voice::audio::FrameQueue;
    use crate::voice::transcriber::SpeechRecognizer;
    use crate::voice::tts::SpeechSynthesizer;
    use crate::voice::vad::VoiceGate;
    use async_trait::async_trait;

    /// Recognizer that hands out one scripted transcript per listen call
    struct QueueRecognizer {
        transcripts: Arc<Mutex<Vec<String>>>,
    }

    impl SpeechRecognizer for QueueRecognizer {
        fn accept_frame(&mut self, _frame: &[i16]) -> Result<Option<String>> {
            Ok(None)
        }

        fn flush(&mut self) -> Result<String> {
            let mut transcripts = self.transcripts.lock().unwrap();
            if transcripts.is_empty() {
                Ok(String::new())
            } else {
                Ok(transcripts.remove(0))
            }
        }
    }

    struct RecordingSynth {
        spoken: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl SpeechSynthesizer for RecordingSynth {
        fn speak(&self, text: &str) -> Result<()> {
            std::thread::sleep(self.delay);
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Streams a long scripted answer slowly so a barge-in can land mid-way
    struct SlowProvider {
        sentences: usize,
        delay: Duration,
    }

    #[async_trait]
    impl GenerationProvider for SlowProvider {
        fn name(&self) -> String {
            "slow".to_string()
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            on_token: &mut (dyn FnMut(String) + Send),
        ) -> Result<(), ProviderError> {
            for i in 0..self.sentences {
                on_token(format!("This is streamed sentence number {i}. "));
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    struct TestHarness {
        controller: Option<VoiceSessionController>,
        trigger_tx: mpsc::Sender<TriggerEvent>,
        trigger_rx: Option<mpsc::Receiver<TriggerEvent>>,
        frames: Arc<FrameQueue>,
        spoken: Arc<Mutex<Vec<String>>>,
        frame_pump: Option<tokio::task::JoinHandle<()>>,
    }

    fn harness(transcripts: &[&str], provider: Box<dyn GenerationProvider>) -> TestHarness {
        let mut config = Config::default();
        config.stt = SttConfig {
            trigger_threshold_ms: 10,
            release_threshold_ms: 10_000,
            idle_timeout_ms: 200,
            vad_enabled: false,
            ..SttConfig::default()
        };
        config.wake.passive_enabled = false;
        config.autonomy.enabled = false;
        config.voice.chunk_chars_min = 5;

        let frames = Arc::new(FrameQueue::new(64));
        let gate = Arc::new(VoiceGate::new(false));
        let recognizer = QueueRecognizer {
            transcripts: Arc::new(Mutex::new(
                transcripts.iter().map(|t| t.to_string()).collect(),
            )),
        };
        let transcriber = Arc::new(StreamingTranscriber::new(
            &config.stt,
            Arc::clone(&frames),
            gate,
            Box::new(recognizer),
        ));

        let spoken = Arc::new(Mutex::new(Vec::new()));
        let tts = Arc::new(TtsWorker::spawn(Box::new(RecordingSynth {
            spoken: Arc::clone(&spoken),
            delay: Duration::from_millis(1),
        })));

        let brain = Arc::new(Brain::with_chain(ProviderChain::new(vec![provider]), ""));
        let (trigger_tx, trigger_rx) = mpsc::channel(8);

        let controller = VoiceSessionController::new(config, transcriber, tts, brain, None);

        TestHarness {
            controller: Some(controller),
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            frames,
            spoken,
            frame_pump: None,
        }
    }

    impl TestHarness {
        /// Keep the capture queue fed so every listen call makes progress
        fn pump_frames(&mut self) {
            let frames = Arc::clone(&self.frames);
            self.frame_pump = Some(tokio::spawn(async move {
                loop {
                    frames.push(vec![8000; 160]);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }));
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            if let Some(pump) = self.frame_pump.take() {
                pump.abort();
            }
        }
    }

    #[tokio::test]
    async fn test_response_is_spoken() {
        let mut h = harness(
            &["what is the weather"],
            Box::new(SlowProvider {
                sentences: 2,
                delay: Duration::from_millis(5),
            }),
        );
        h.pump_frames();

        let rx = h.trigger_rx.take().unwrap();
        let tx = h.trigger_tx.clone();
        let mut controller = h.controller.take().unwrap();
        let spoken = Arc::clone(&h.spoken);

        let session = tokio::spawn(async move { controller.run(rx).await });

        tx.send(TriggerEvent::hotkey()).await.unwrap();

        let mut saw_response = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if spoken
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.contains("sentence number 0"))
            {
                saw_response = true;
                break;
            }
        }
        assert!(saw_response, "expected streamed response to be spoken");

        drop(tx);
        drop(h);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_barge_in_stops_speech_and_returns_to_idle() {
        let mut h = harness(
            &["tell me a story", "unused"],
            Box::new(SlowProvider {
                sentences: 50,
                delay: Duration::from_millis(20),
            }),
        );
        h.pump_frames();

        let rx = h.trigger_rx.take().unwrap();
        let tx = h.trigger_tx.clone();
        let mut controller = h.controller.take().unwrap();
        let state = Arc::clone(&controller.state);
        let spoken = Arc::clone(&h.spoken);

        let session = tokio::spawn(async move { controller.run(rx).await });

        tx.send(TriggerEvent::hotkey()).await.unwrap();

        // Wait until the response is streaming
        let mut reached_speaking = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if *state.lock().unwrap() == VoiceState::Speaking {
                reached_speaking = true;
                break;
            }
        }
        assert!(reached_speaking, "session never reached Speaking");

        // Barge in
        tx.send(TriggerEvent::hotkey()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*state.lock().unwrap(), VoiceState::Idle);

        let spoken_at_barge_in = spoken.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let spoken_after = spoken.lock().unwrap().len();
        // At most the in-flight unit finishes; nothing new is spoken
        assert!(spoken_after <= spoken_at_barge_in + 1);

        drop(tx);
        drop(h);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_generation_speaks_apology() {
        struct DownProvider;

        #[async_trait]
        impl GenerationProvider for DownProvider {
            fn name(&self) -> String {
                "down".to_string()
            }

            async fn stream(
                &self,
                _messages: &[ChatMessage],
                _on_token: &mut (dyn FnMut(String) + Send),
            ) -> Result<(), ProviderError> {
                Err(ProviderError::Request("offline".to_string()))
            }
        }

        let mut h = harness(&["hello"], Box::new(DownProvider));
        h.pump_frames();

        let rx = h.trigger_rx.take().unwrap();
        let tx = h.trigger_tx.clone();
        let mut controller = h.controller.take().unwrap();
        let spoken = Arc::clone(&h.spoken);

        let session = tokio::spawn(async move { controller.run(rx).await });

        tx.send(TriggerEvent::hotkey()).await.unwrap();

        let mut saw_apology = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if spoken.lock().unwrap().iter().any(|s| s.contains("sorry")) {
                saw_apology = true;
                break;
            }
        }
        assert!(saw_apology, "expected apology to be spoken");

        drop(tx);
        drop(h);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_transcript_returns_to_idle_without_speaking() {
        let mut h = harness(
            &[],
            Box::new(SlowProvider {
                sentences: 1,
                delay: Duration::from_millis(1),
            }),
        );
        h.pump_frames();

        let rx = h.trigger_rx.take().unwrap();
        let tx = h.trigger_tx.clone();
        let mut controller = h.controller.take().unwrap();
        let state = Arc::clone(&controller.state);
        let spoken = Arc::clone(&h.spoken);

        let session = tokio::spawn(async move { controller.run(rx).await });

        tx.send(TriggerEvent::hotkey()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(*state.lock().unwrap(), VoiceState::Idle);
        assert!(spoken.lock().unwrap().is_empty());

        drop(tx);
        drop(h);
        session.await.unwrap().unwrap();
    }
}
