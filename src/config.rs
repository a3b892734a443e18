//! Configuration management
//!
//! Loads an immutable `Config` once at startup from `config.toml` (with a few
//! environment variable overrides) and passes it by reference into each
//! component constructor. No component reads ambient global state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Voice pipeline settings (chunking, playback)
    #[serde(default)]
    pub voice: VoiceConfig,
    /// Streaming transcription settings
    #[serde(default)]
    pub stt: SttConfig,
    /// Wake phrase / hotkey activation settings
    #[serde(default)]
    pub wake: WakeConfig,
    /// Generation provider settings
    #[serde(default)]
    pub brain: BrainConfig,
    /// Background suggestion engine settings
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    /// Suggestion confirmation flow settings
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    /// Conversation memory settings
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Voice pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Regex marking speakable phrase boundaries in streamed text
    #[serde(default = "default_boundary_regex")]
    pub sentence_boundary_regex: String,
    /// Minimum characters before a boundary match is flushed as a phrase
    #[serde(default = "default_chunk_chars_min")]
    pub chunk_chars_min: usize,
    /// Synthesis engine: "piper", "espeak", or "null"
    #[serde(default = "default_tts_engine")]
    pub tts_engine: String,
    /// Path to the piper binary (when tts_engine = "piper")
    #[serde(default = "default_piper_bin")]
    pub piper_bin: String,
    /// Piper voice model path
    #[serde(default)]
    pub piper_model: Option<PathBuf>,
}

fn default_boundary_regex() -> String {
    r"[.!?;:]\s".to_string()
}

fn default_chunk_chars_min() -> usize {
    20
}

fn default_tts_engine() -> String {
    "espeak".to_string()
}

fn default_piper_bin() -> String {
    "piper".to_string()
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sentence_boundary_regex: default_boundary_regex(),
            chunk_chars_min: default_chunk_chars_min(),
            tts_engine: default_tts_engine(),
            piper_bin: default_piper_bin(),
            piper_model: None,
        }
    }
}

/// Streaming transcription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Capture sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Frame size in samples handed to the gate/recognizer
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// Speech must persist this long before an utterance opens
    #[serde(default = "default_trigger_ms")]
    pub trigger_threshold_ms: u64,
    /// Silence this long inside an utterance ends it
    #[serde(default = "default_release_ms")]
    pub release_threshold_ms: u64,
    /// Give up after this long with no utterance
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Enable the voice-activity gate (fails open when unavailable)
    #[serde(default = "default_true")]
    pub vad_enabled: bool,
    /// Path to a Vosk model directory (feature "vosk-stt")
    #[serde(default)]
    pub vosk_model_path: Option<PathBuf>,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_frame_size() -> usize {
    160
}

fn default_trigger_ms() -> u64 {
    250
}

fn default_release_ms() -> u64 {
    300
}

fn default_idle_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_size: default_frame_size(),
            trigger_threshold_ms: default_trigger_ms(),
            release_threshold_ms: default_release_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            vad_enabled: true,
            vosk_model_path: None,
        }
    }
}

/// Activation signal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    /// Hotkey character that triggers a listening session
    #[serde(default = "default_hotkey")]
    pub hotkey: char,
    /// Enable the passive wake-phrase listener
    #[serde(default = "default_true")]
    pub passive_enabled: bool,
    /// Wake phrases matched case-insensitively in recognized text
    #[serde(default = "default_wake_phrases")]
    pub phrases: Vec<String>,
}

fn default_hotkey() -> char {
    ' '
}

fn default_wake_phrases() -> Vec<String> {
    vec!["hey aria".to_string(), "okay aria".to_string()]
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            hotkey: default_hotkey(),
            passive_enabled: true,
            phrases: default_wake_phrases(),
        }
    }
}

/// Generation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConfig {
    /// Primary provider: "ollama" or "openai"
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier passed to the provider
    #[serde(default = "default_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_brain_timeout")]
    pub timeout_secs: u64,
    /// System prompt injected as the first message of every generation
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Ordered fallback providers walked when the primary fails
    #[serde(default)]
    pub fallback: Vec<ProviderEntry>,
    /// Ollama endpoint
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    /// OpenAI-compatible endpoint
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    /// API key for the OpenAI-compatible endpoint (env ARIA_OPENAI_API_KEY)
    #[serde(default)]
    pub openai_api_key: Option<String>,
    /// Spoken when generation fails mid-response
    #[serde(default = "default_apology")]
    pub apology_phrase: String,
}

/// One entry in the provider fallback chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider: String,
    pub model: String,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "qwen3:4b".to_string()
}

fn default_brain_timeout() -> u64 {
    120
}

fn default_system_prompt() -> String {
    "You are Aria, a concise and helpful voice assistant. \
     Answer in short sentences suitable for being read aloud."
        .to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_apology() -> String {
    "I'm sorry, I ran into a problem while answering that.".to_string()
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            timeout_secs: default_brain_timeout(),
            system_prompt: default_system_prompt(),
            fallback: Vec::new(),
            ollama_url: default_ollama_url(),
            openai_url: default_openai_url(),
            openai_api_key: None,
            apology_phrase: default_apology(),
        }
    }
}

/// Background suggestion engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyConfig {
    /// Master switch for the suggestion engine
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum seconds between emitted suggestions
    #[serde(default = "default_suggestion_interval")]
    pub interval_secs: u64,
    /// Suggestions below this confidence are discarded
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Enrich suggestions with memory snippets
    #[serde(default = "default_true")]
    pub use_memory: bool,
    /// Maximum memory snippets attached to one suggestion
    #[serde(default = "default_max_snippets")]
    pub max_memory_snippets: usize,
    /// Phrases that signal the user is weighing a decision
    #[serde(default = "default_decision_keywords")]
    pub decision_keywords: Vec<String>,
    /// Topics worth volunteering help on
    #[serde(default = "default_high_value_topics")]
    pub high_value_topics: Vec<String>,
    /// Regexes matching hesitation markers
    #[serde(default = "default_hesitation_patterns")]
    pub hesitation_patterns: Vec<String>,
}

fn default_suggestion_interval() -> u64 {
    45
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_max_snippets() -> usize {
    5
}

fn default_decision_keywords() -> Vec<String> {
    [
        "should i",
        "what if",
        "maybe",
        "i think",
        "i'm not sure",
        "help me decide",
        "i need to",
        "i want to",
        "i have to",
        "i should",
        "i could",
        "i might",
        "what do you think",
        "any suggestions",
        "any ideas",
        "what would you do",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_high_value_topics() -> Vec<String> {
    [
        "work", "project", "meeting", "deadline", "plan", "schedule", "task", "problem", "issue",
        "decision", "choice", "option", "strategy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_hesitation_patterns() -> Vec<String> {
    vec![
        r"\b(um|uh|er|ah|hmm|well|so|like|you know)\b".to_string(),
        r"\b(i mean|i guess|i suppose|sort of|kind of)\b".to_string(),
    ]
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_suggestion_interval(),
            confidence_threshold: default_confidence_threshold(),
            use_memory: true,
            max_memory_snippets: default_max_snippets(),
            decision_keywords: default_decision_keywords(),
            high_value_topics: default_high_value_topics(),
            hesitation_patterns: default_hesitation_patterns(),
        }
    }
}

/// Confirmation flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Seconds without foreground activity before the user counts as idle
    #[serde(default = "default_idle_secs")]
    pub idle_detection_secs: f32,
    /// Seconds the batch window stays open after the first suggestion
    #[serde(default = "default_batch_secs")]
    pub batching_window_secs: f32,
    /// Seconds to wait for a yes/no answer
    #[serde(default = "default_confirm_timeout")]
    pub response_timeout_secs: u64,
    /// Words accepted as a yes
    #[serde(default = "default_yes_words")]
    pub yes_words: Vec<String>,
    /// Words accepted as a no
    #[serde(default = "default_no_words")]
    pub no_words: Vec<String>,
    /// Confirmation prompts keyed by trigger type
    #[serde(default)]
    pub prompts: ConfirmationPrompts,
}

fn default_idle_secs() -> f32 {
    3.0
}

fn default_batch_secs() -> f32 {
    2.0
}

fn default_confirm_timeout() -> u64 {
    4
}

fn default_yes_words() -> Vec<String> {
    ["yes", "sure", "okay", "go ahead", "please", "sounds good"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_no_words() -> Vec<String> {
    ["no", "not now", "later", "skip", "dismiss"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            idle_detection_secs: default_idle_secs(),
            batching_window_secs: default_batch_secs(),
            response_timeout_secs: default_confirm_timeout(),
            yes_words: default_yes_words(),
            no_words: default_no_words(),
            prompts: ConfirmationPrompts::default(),
        }
    }
}

/// Spoken confirmation prompts, one per trigger type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationPrompts {
    #[serde(default = "default_prompt_decision")]
    pub decision_keyword: String,
    #[serde(default = "default_prompt_topic")]
    pub high_value_topic: String,
    #[serde(default = "default_prompt_hesitation")]
    pub hesitation: String,
    #[serde(default = "default_prompt_repetition")]
    pub repetition: String,
    #[serde(default = "default_prompt_fallback")]
    pub fallback: String,
}

fn default_prompt_decision() -> String {
    "I noticed you're working through a decision. I have some thoughts that might help. \
     Would you like to hear them?"
        .to_string()
}

fn default_prompt_topic() -> String {
    "I picked up on something important you mentioned. I might have some useful insights. \
     Interested?"
        .to_string()
}

fn default_prompt_hesitation() -> String {
    "It sounds like you're thinking through something. I have some ideas that might help. \
     Want to hear them?"
        .to_string()
}

fn default_prompt_repetition() -> String {
    "I notice this topic has come up before. I have some thoughts that might be helpful. \
     Would you like to hear them?"
        .to_string()
}

fn default_prompt_fallback() -> String {
    "I have a thought. Would you like to hear it?".to_string()
}

impl Default for ConfirmationPrompts {
    fn default() -> Self {
        Self {
            decision_keyword: default_prompt_decision(),
            high_value_topic: default_prompt_topic(),
            hesitation: default_prompt_hesitation(),
            repetition: default_prompt_repetition(),
            fallback: default_prompt_fallback(),
        }
    }
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database path; None means the platform data dir
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Rows kept when trimming the store
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    5000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_messages: default_max_messages(),
        }
    }
}

impl Config {
    /// Default config file path (~/.config/aria/config.toml)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("aria").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Load configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::warn!(
                "Config file not found at {}; using defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for the handful of deploy-sensitive scalars
    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("ARIA_BRAIN_MODEL") {
            self.brain.model = model;
        }
        if let Ok(provider) = std::env::var("ARIA_BRAIN_PROVIDER") {
            self.brain.provider = provider;
        }
        if let Ok(url) = std::env::var("ARIA_OLLAMA_URL") {
            self.brain.ollama_url = url;
        }
        if let Ok(key) = std::env::var("ARIA_OPENAI_API_KEY") {
            self.brain.openai_api_key = Some(key);
        }
        if let Ok(v) = std::env::var("ARIA_AUTONOMY_ENABLED") {
            self.autonomy.enabled = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    /// Default memory database path (~/.local/share/aria/memory.db)
    pub fn memory_db_path(&self) -> PathBuf {
        self.memory.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("aria").join("memory.db"))
                .unwrap_or_else(|| PathBuf::from("memory.db"))
        })
    }
}
