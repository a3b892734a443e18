//! Background autonomy
//!
//! Heuristic detection of decision points in recent user input, a polling
//! engine that turns them into queued suggestions, and the idle-gated
//! confirmation flow that asks before speaking any of them.

pub mod confirmation;
pub mod engine;
pub mod scorer;

pub use confirmation::{BatchedSuggestion, ConfirmationCoordinator, ConfirmationIo};
pub use engine::{AutonomousSuggestion, AutonomyEngine};
pub use scorer::{ScoreResult, SuggestionScorer, TriggerType};
