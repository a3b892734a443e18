//! Suggestion confirmation flow
//!
//! Suggestions are never spoken the moment they arrive. They collect in a
//! short batch window, wait for the user to be idle, and then a single
//! confirmation prompt is spoken. Silence or an unclear answer counts as a
//! no: consent must be explicit.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::autonomy::engine::AutonomousSuggestion;
use crate::autonomy::scorer::TriggerType;
use crate::config::ConfirmationConfig;

/// Most suggestions folded into one confirmation round
const MAX_BATCH: usize = 3;

/// Most context snippets passed to the concise rendering
const MAX_RENDER_SNIPPETS: usize = 8;

/// Dialogue side of the confirmation flow, implemented by the session
/// controller (speak through the synthesis worker, listen through the
/// transcriber, render through the generation collaborator).
#[async_trait::async_trait]
pub trait ConfirmationIo: Send + Sync {
    /// A confirmation dialogue is taking over the speech path
    fn dialogue_started(&self) {}
    /// The dialogue is over; the speech path is free again
    fn dialogue_finished(&self) {}
    /// Speak a prompt and wait for playback to finish
    async fn speak(&self, text: &str);
    /// Listen for one short reply; None on timeout or no speech
    async fn listen(&self, timeout: Duration) -> Option<String>;
    /// Ask the generation collaborator for a concise rendering of the
    /// suggestion content; None when generation fails
    async fn render(&self, combined_text: &str, context_snippets: &[String]) -> Option<String>;
}

/// 1-3 suggestions folded into a single confirmation round
#[derive(Debug, Clone)]
pub struct BatchedSuggestion {
    pub suggestions: Vec<AutonomousSuggestion>,
    pub combined_text: String,
    pub highest_confidence: f32,
    pub primary_trigger: TriggerType,
}

/// Batches suggestions, gates them on user idleness, and runs the spoken
/// yes/no confirmation dialogue.
pub struct ConfirmationCoordinator {
    config: ConfirmationConfig,
    io: Arc<dyn ConfirmationIo>,
    last_activity: Mutex<Option<Instant>>,
    pending: Mutex<Vec<AutonomousSuggestion>>,
    batch_timer: Mutex<Option<JoinHandle<()>>>,
    /// Self-handle for spawning the batch timer from `&self`
    weak_self: Weak<Self>,
}

impl ConfirmationCoordinator {
    pub fn new(config: &ConfirmationConfig, io: Arc<dyn ConfirmationIo>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config: config.clone(),
            io,
            last_activity: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            batch_timer: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Record foreground user activity (speaking, triggering)
    pub fn update_activity(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Some(Instant::now());
        }
    }

    /// Whether the user has been quiet long enough to be prompted
    pub fn is_idle(&self) -> bool {
        let threshold = Duration::from_secs_f32(self.config.idle_detection_secs);
        match self.last_activity.lock() {
            Ok(at) => at.map(|t| t.elapsed() >= threshold).unwrap_or(true),
            Err(_) => false,
        }
    }

    /// Queue a suggestion. The first pending item opens the batch window;
    /// later arrivals just join the batch.
    pub fn add_suggestion(&self, suggestion: AutonomousSuggestion) {
        let is_first = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            pending.push(suggestion);
            pending.len() == 1
        };

        if is_first {
            let Some(coordinator) = self.weak_self.upgrade() else {
                return;
            };
            let window = Duration::from_secs_f32(self.config.batching_window_secs);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                coordinator.close_batch().await;
            });
            if let Ok(mut slot) = self.batch_timer.lock() {
                if let Some(old) = slot.replace(timer) {
                    old.abort();
                }
            }
        }
    }

    /// Discard pending suggestions and cancel the batch window (barge-in)
    pub fn clear_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if !pending.is_empty() {
                debug!("Clearing {} pending suggestion(s)", pending.len());
            }
            pending.clear();
        }
        if let Ok(mut slot) = self.batch_timer.lock() {
            if let Some(timer) = slot.take() {
                timer.abort();
            }
        }
    }

    /// Batch window expired: either discard (user busy) or confirm and
    /// deliver.
    async fn close_batch(&self) {
        let batched = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            if pending.is_empty() {
                return;
            }
            if !self.is_idle() {
                info!("User not idle; discarding suggestion batch");
                pending.clear();
                return;
            }
            let batch = build_batch(&pending);
            pending.clear();
            batch
        };

        let Some(batched) = batched else { return };

        self.io.dialogue_started();
        if self.present_confirmation(&batched).await {
            info!("User confirmed suggestion batch");
            self.deliver(&batched).await;
        } else {
            info!("User dismissed suggestion batch");
        }
        self.io.dialogue_finished();
    }

    /// Speak the trigger-specific prompt and listen for a yes/no answer.
    /// Anything other than a clear yes is a no.
    async fn present_confirmation(&self, batched: &BatchedSuggestion) -> bool {
        let prompt = self.confirmation_prompt(batched.primary_trigger);
        self.io.speak(&prompt).await;

        let timeout = Duration::from_secs(self.config.response_timeout_secs);
        let Some(response) = self.io.listen(timeout).await else {
            debug!("No confirmation response before timeout");
            return false;
        };

        self.match_response(&response)
    }

    /// Case-insensitive match against the yes/no word sets; unmatched
    /// responses default to no.
    fn match_response(&self, response: &str) -> bool {
        let lowered = response.trim().to_lowercase();
        if self
            .config
            .yes_words
            .iter()
            .any(|w| lowered.contains(&w.to_lowercase()))
        {
            return true;
        }
        if self
            .config
            .no_words
            .iter()
            .any(|w| lowered.contains(&w.to_lowercase()))
        {
            debug!("Explicit dismissal: {lowered}");
            return false;
        }
        debug!("Unclear confirmation response; treating as no");
        false
    }

    fn confirmation_prompt(&self, trigger: TriggerType) -> String {
        let prompts = &self.config.prompts;
        match trigger {
            TriggerType::DecisionKeyword => prompts.decision_keyword.clone(),
            TriggerType::HighValueTopic => prompts.high_value_topic.clone(),
            TriggerType::Hesitation => prompts.hesitation.clone(),
            TriggerType::Repetition => prompts.repetition.clone(),
            TriggerType::Periodic => prompts.fallback.clone(),
        }
    }

    /// Deliver the confirmed content: concise rendering via the generation
    /// collaborator when it succeeds, raw combined text otherwise.
    async fn deliver(&self, batched: &BatchedSuggestion) {
        let snippets = collect_snippets(&batched.suggestions);
        let text = match self.io.render(&batched.combined_text, &snippets).await {
            Some(rendered) if !rendered.trim().is_empty() => rendered,
            _ => {
                warn!("Concise rendering unavailable; speaking raw suggestion text");
                batched.combined_text.clone()
            }
        };
        self.io.speak(&text).await;
    }

    /// Pending suggestion count (diagnostics)
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// Fold pending suggestions into one batch: top-3 by descending confidence
pub fn build_batch(pending: &[AutonomousSuggestion]) -> Option<BatchedSuggestion> {
    if pending.is_empty() {
        return None;
    }

    let mut sorted: Vec<AutonomousSuggestion> = pending.to_vec();
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted.truncate(MAX_BATCH);

    let combined_text = match sorted.len() {
        1 => sorted[0].text.clone(),
        2 => format!(
            "I have a couple of thoughts: {} Also, {}",
            sorted[0].text, sorted[1].text
        ),
        _ => format!(
            "I have a few thoughts: {} Also, {} And {}",
            sorted[0].text, sorted[1].text, sorted[2].text
        ),
    };

    Some(BatchedSuggestion {
        highest_confidence: sorted[0].confidence,
        primary_trigger: sorted[0].trigger,
        combined_text,
        suggestions: sorted,
    })
}

/// Order-preserving dedup of context snippets across the batch, capped for
/// the rendering prompt.
fn collect_snippets(suggestions: &[AutonomousSuggestion]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut snippets = Vec::new();
    for suggestion in suggestions {
        for snippet in &suggestion.context_snippets {
            if seen.insert(snippet.clone()) {
                snippets.push(snippet.clone());
                if snippets.len() >= MAX_RENDER_SNIPPETS {
                    return snippets;
                }
            }
        }
    }
    snippets
}
