//! Suggestion scoring
//!
//! Stateless heuristic analysis of recent user text. The scorer exists to
//! detect decision points: moments where the user appears to be weighing
//! options. A result that stays [`TriggerType::Periodic`] means "no
//! actionable suggestion" and must never be surfaced to the user.

use regex::Regex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::AutonomyConfig;

/// Decision keyword matches contribute up to this much confidence
const DECISION_CAP: f32 = 0.8;
const DECISION_WEIGHT: f32 = 0.3;

/// High-value topic matches contribute up to this much
const TOPIC_CAP: f32 = 0.6;
const TOPIC_WEIGHT: f32 = 0.2;

/// Hesitation marker matches contribute up to this much
const HESITATION_CAP: f32 = 0.4;
const HESITATION_WEIGHT: f32 = 0.1;

/// Flat bonus for an exact duplicate in the recent history
const REPETITION_BONUS: f32 = 0.3;

/// Bonus when the latest input is fresh
const RECENCY_BONUS: f32 = 0.2;
const RECENCY_WINDOW: Duration = Duration::from_secs(30);

/// What pushed a suggestion over the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Timer-driven default; never actionable
    Periodic,
    DecisionKeyword,
    HighValueTopic,
    Hesitation,
    Repetition,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Periodic => "periodic",
            TriggerType::DecisionKeyword => "decision_keyword",
            TriggerType::HighValueTopic => "high_value_topic",
            TriggerType::Hesitation => "hesitation",
            TriggerType::Repetition => "repetition",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scoring outcome for one analysis pass
#[derive(Debug, Clone)]
pub struct ScoreResult {
    /// Clamped to [0, 1]
    pub confidence: f32,
    pub trigger: TriggerType,
    /// First matching high-value topic, if any
    pub topic: Option<String>,
}

/// Heuristic scorer over `(latest input, recent history, last activity)`
pub struct SuggestionScorer {
    decision_keywords: Vec<String>,
    high_value_topics: Vec<String>,
    hesitation_patterns: Vec<Regex>,
}

impl SuggestionScorer {
    pub fn new(config: &AutonomyConfig) -> Self {
        let hesitation_patterns = config
            .hesitation_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping invalid hesitation pattern '{p}': {e}");
                    None
                }
            })
            .collect();

        Self {
            decision_keywords: config
                .decision_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            high_value_topics: config
                .high_value_topics
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            hesitation_patterns,
        }
    }

    /// Score the latest user input against the recent history.
    ///
    /// `history` is the recent inputs oldest-first, including the latest;
    /// `last_activity` is when that input arrived.
    pub fn score(
        &self,
        latest: &str,
        history: &[String],
        last_activity: Option<Instant>,
    ) -> ScoreResult {
        let text = latest.to_lowercase();
        let mut confidence = 0.0f32;
        let mut trigger = TriggerType::Periodic;
        let mut topic = None;

        let decision_score: f32 = self
            .decision_keywords
            .iter()
            .filter(|k| text.contains(k.as_str()))
            .count() as f32
            * DECISION_WEIGHT;
        if decision_score > 0.0 {
            confidence += decision_score.min(DECISION_CAP);
            trigger = TriggerType::DecisionKeyword;
        }

        let mut topic_score = 0.0f32;
        for topic_word in &self.high_value_topics {
            if text.contains(topic_word.as_str()) {
                topic_score += TOPIC_WEIGHT;
                if topic.is_none() {
                    topic = Some(topic_word.clone());
                }
            }
        }
        if topic_score > 0.0 {
            confidence += topic_score.min(TOPIC_CAP);
            if trigger == TriggerType::Periodic {
                trigger = TriggerType::HighValueTopic;
            }
        }

        let hesitation_count: usize = self
            .hesitation_patterns
            .iter()
            .map(|re| re.find_iter(&text).count())
            .sum();
        if hesitation_count > 0 {
            confidence += (hesitation_count as f32 * HESITATION_WEIGHT).min(HESITATION_CAP);
            if trigger == TriggerType::Periodic {
                trigger = TriggerType::Hesitation;
            }
        }

        if has_recent_duplicate(history) {
            confidence += REPETITION_BONUS;
            if trigger == TriggerType::Periodic {
                trigger = TriggerType::Repetition;
            }
        }

        if let Some(at) = last_activity {
            if at.elapsed() < RECENCY_WINDOW {
                confidence += RECENCY_BONUS;
            }
        }

        ScoreResult {
            confidence: confidence.clamp(0.0, 1.0),
            trigger,
            topic,
        }
    }
}

/// Exact duplicate among the last three history entries
fn has_recent_duplicate(history: &[String]) -> bool {
    if history.len() < 3 {
        return false;
    }
    let recent: Vec<String> = history[history.len() - 3..]
        .iter()
        .map(|t| t.to_lowercase())
        .collect();
    let unique: std::collections::HashSet<&String> = recent.iter().collect();
    unique.len() < recent.len()
}
