//! Aria - Real-time Voice Assistant Library
//!
//! A voice-driven conversational front end that interleaves audio capture,
//! streaming transcription, token-streamed generation, and phrase-chunked
//! speech synthesis, with:
//! - Barge-in: the user can interrupt a response at any time
//! - A background autonomy engine that detects decision points in recent
//!   input and offers suggestions through an idle-gated confirmation flow
//! - Multi-provider generation with ordered fallback
//! - SQLite-backed conversation memory
//!
//! # Example
//!
//! ```ignore
//! use aria::brain::Brain;
//! use aria::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let brain = Brain::from_config(&config.brain)?;
//!     let answer = brain.generate("Hello!", &[]).await?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```

pub mod autonomy;
pub mod brain;
pub mod cli;
pub mod config;
pub mod console;
pub mod memory;
pub mod session;
pub mod voice;

// Re-export commonly used types for convenience
pub use autonomy::{AutonomousSuggestion, AutonomyEngine, SuggestionScorer, TriggerType};
pub use brain::{Brain, StreamEvent};
pub use config::Config;
pub use memory::MemoryStore;
pub use session::{VoiceSessionController, VoiceState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
