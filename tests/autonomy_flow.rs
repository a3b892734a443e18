//! End-to-end checks of the autonomy path: scoring, batching, pause/resume,
//! and the streaming chunker composition, all through the public API.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aria::autonomy::confirmation::build_batch;
use aria::autonomy::engine::AutonomousSuggestion;
use aria::autonomy::{AutonomyEngine, SuggestionScorer, TriggerType};
use aria::config::{AutonomyConfig, VoiceConfig};
use aria::voice::tts::{PhraseChunker, SpeechSynthesizer, TtsWorker};

#[test]
fn decision_point_produces_actionable_score() {
    let scorer = SuggestionScorer::new(&AutonomyConfig::default());
    let input = "I'm not sure what I should do about this project".to_string();

    let result = scorer.score(&input, std::slice::from_ref(&input), Some(Instant::now()));

    assert_eq!(result.trigger, TriggerType::DecisionKeyword);
    assert!(result.confidence > 0.3);
}

#[test]
fn greeting_produces_no_actionable_suggestion() {
    let scorer = SuggestionScorer::new(&AutonomyConfig::default());
    let input = "hello there".to_string();

    let result = scorer.score(&input, std::slice::from_ref(&input), Some(Instant::now()));

    assert_eq!(result.trigger, TriggerType::Periodic);
}

#[tokio::test]
async fn decision_input_flows_into_queue_with_rendered_text() {
    let config = AutonomyConfig {
        interval_secs: 0,
        confidence_threshold: 0.3,
        use_memory: false,
        ..AutonomyConfig::default()
    };
    let mut engine = AutonomyEngine::new(&config, None);
    engine.start();
    engine.resume();
    engine.update_user_input("I'm not sure what I should do about this project");

    let mut suggestion = None;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(s) = engine.pop_suggestion() {
            suggestion = Some(s);
            break;
        }
    }
    engine.stop().await;

    let suggestion = suggestion.expect("engine should have emitted a suggestion");
    assert_eq!(suggestion.trigger, TriggerType::DecisionKeyword);
    assert!(suggestion.confidence > 0.3);
    assert!(!suggestion.text.is_empty());
}

#[tokio::test]
async fn paused_engine_never_emits() {
    let config = AutonomyConfig {
        interval_secs: 0,
        confidence_threshold: 0.1,
        use_memory: false,
        ..AutonomyConfig::default()
    };
    let mut engine = AutonomyEngine::new(&config, None);
    engine.start();
    // Deliberately left paused
    engine.update_user_input("I'm not sure what I should do about this project");

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(engine.queue_len(), 0);

    engine.stop().await;
}

#[test]
fn batch_of_three_picks_top_confidence_and_trigger() {
    let mk = |text: &str, confidence: f32, trigger| AutonomousSuggestion {
        text: text.to_string(),
        confidence,
        trigger,
        topic: None,
        timestamp: chrono::Utc::now(),
        context_snippets: Vec::new(),
    };

    let pending = vec![
        mk("a", 0.8, TriggerType::DecisionKeyword),
        mk("b", 0.6, TriggerType::HighValueTopic),
        mk("c", 0.4, TriggerType::Hesitation),
    ];

    let batched = build_batch(&pending).expect("non-empty batch");
    assert!((batched.highest_confidence - 0.8).abs() < 1e-6);
    assert_eq!(batched.primary_trigger, TriggerType::DecisionKeyword);
}

/// Token stream -> chunker -> worker: phrases come out in order, and a stop
/// mid-stream drops everything still queued.
#[tokio::test]
async fn streamed_tokens_are_spoken_in_order_until_stopped() {
    struct Recorder {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl SpeechSynthesizer for Recorder {
        fn speak(&self, text: &str) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    let spoken = Arc::new(Mutex::new(Vec::new()));
    let worker = TtsWorker::spawn(Box::new(Recorder {
        spoken: Arc::clone(&spoken),
    }));

    let voice_config = VoiceConfig {
        chunk_chars_min: 5,
        ..VoiceConfig::default()
    };
    let mut chunker = PhraseChunker::new(&voice_config).unwrap();

    for token in ["First sen", "tence here. ", "Second sentence here. "] {
        for phrase in chunker.push(token) {
            worker.enqueue(&phrase);
        }
    }
    worker.wait_until_idle().await;

    {
        let spoken = spoken.lock().unwrap();
        assert_eq!(
            *spoken,
            vec![
                "First sentence here.".to_string(),
                "Second sentence here.".to_string()
            ]
        );
    }

    // Queue a burst and interrupt it
    for i in 0..20 {
        worker.enqueue(&format!("Phrase number {i} to be dropped."));
    }
    worker.stop();
    worker.wait_until_idle().await;

    let spoken_len = spoken.lock().unwrap().len();
    assert!(spoken_len <= 4, "stop should have cleared the queue");
    worker.shutdown();
}
