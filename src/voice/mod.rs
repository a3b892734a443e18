//! Voice pipeline
//!
//! Capture → gate → transcription on the input side, phrase chunking →
//! serialized synthesis on the output side, plus the activation signals that
//! start a session. Heavy audio I/O (cpal/rodio) sits behind the `voice`
//! feature; everything else is engine-agnostic and testable without a device.

pub mod audio;
pub mod transcriber;
pub mod tts;
pub mod vad;
pub mod wake;

pub use transcriber::{CancelFlag, SpeechRecognizer, StreamingTranscriber};
pub use tts::{PhraseChunker, SpeechSynthesizer, TtsWorker};
pub use vad::VoiceGate;
pub use wake::{TriggerEvent, TriggerSource};
