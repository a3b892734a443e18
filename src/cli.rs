//! Command-line interface
//!
//! `aria run` wires the full voice pipeline (capture, transcription,
//! synthesis, autonomy) and drives the session controller; `aria run
//! --console` swaps in the text REPL; `aria status` reports configuration
//! and provider health.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::brain::Brain;
use crate::config::Config;
use crate::console::ConsoleInterface;
use crate::memory::MemoryStore;
use crate::session::VoiceSessionController;
use crate::voice::audio::FrameQueue;
use crate::voice::transcriber::{recognizer_from_config, StreamingTranscriber};
use crate::voice::tts::{CommandSynthesizer, NullSynthesizer, SpeechSynthesizer, TtsWorker};
use crate::voice::vad::VoiceGate;
use crate::voice::wake::HotkeyListener;

#[derive(Parser)]
#[command(name = "aria", version, about = "Real-time voice assistant")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the assistant (default)
    Run {
        /// Use the text console instead of the voice pipeline
        #[arg(long)]
        console: bool,
    },
    /// Show configuration and provider status
    Status,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command.unwrap_or(Commands::Run { console: false }) {
        Commands::Run { console: true } => run_console(config).await,
        Commands::Run { console: false } => run_voice(config).await,
        Commands::Status => show_status(config).await,
    }
}

fn open_memory(config: &Config) -> Option<Arc<MemoryStore>> {
    match MemoryStore::open(config.memory_db_path(), config.memory.max_messages) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Memory store unavailable ({e}); continuing without persistence");
            None
        }
    }
}

/// Pick the synthesis engine per config, falling back down the chain when a
/// backend is unavailable.
fn synthesizer_from_config(config: &Config) -> Box<dyn SpeechSynthesizer> {
    match config.voice.tts_engine.as_str() {
        #[cfg(feature = "voice")]
        "piper" => {
            if let Some(ref model) = config.voice.piper_model {
                match crate::voice::tts::PiperSynthesizer::new(&config.voice.piper_bin, model) {
                    Ok(engine) => return Box::new(engine),
                    Err(e) => warn!("Piper unavailable ({e}); falling back to command engine"),
                }
            } else {
                warn!("tts_engine is 'piper' but no piper_model is configured");
            }
            Box::new(CommandSynthesizer::new())
        }
        #[cfg(not(feature = "voice"))]
        "piper" => {
            warn!("tts_engine 'piper' requires the voice feature; using command engine");
            Box::new(CommandSynthesizer::new())
        }
        "null" => Box::new(NullSynthesizer),
        _ => Box::new(CommandSynthesizer::new()),
    }
}

async fn run_voice(config: Config) -> Result<()> {
    info!("Starting voice assistant");

    let memory = open_memory(&config);
    let brain = Arc::new(Brain::from_config(&config.brain)?);

    let frames = Arc::new(FrameQueue::new(256));
    let gate = Arc::new(VoiceGate::new(config.stt.vad_enabled));
    let recognizer = recognizer_from_config(&config.stt);
    let transcriber = Arc::new(StreamingTranscriber::new(
        &config.stt,
        Arc::clone(&frames),
        gate,
        recognizer,
    ));

    let tts = Arc::new(TtsWorker::spawn(synthesizer_from_config(&config)));

    #[cfg(feature = "voice")]
    let mut capture = crate::voice::audio::start_capture_thread(
        config.stt.sample_rate,
        config.stt.frame_size,
        Arc::clone(&frames),
    );
    #[cfg(not(feature = "voice"))]
    warn!("Built without the voice feature; no audio capture available");

    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let mut hotkey = HotkeyListener::spawn(config.wake.hotkey, trigger_tx);

    println!("Aria is listening. Press '{}' to speak.", config.wake.hotkey);

    let mut controller =
        VoiceSessionController::new(config, transcriber, tts, brain, memory);

    tokio::select! {
        result = controller.run(trigger_rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    hotkey.stop();
    #[cfg(feature = "voice")]
    capture.stop();

    Ok(())
}

async fn run_console(config: Config) -> Result<()> {
    info!("Starting console interface");
    let memory = open_memory(&config);
    let brain =
        Arc::new(Brain::from_config(&config.brain).context("Failed to initialize providers")?);
    ConsoleInterface::new(brain, memory).run().await
}

async fn show_status(config: Config) -> Result<()> {
    println!("aria {}", env!("CARGO_PKG_VERSION"));
    println!("config file: {}", Config::default_path().display());
    println!("model: {}", config.brain.model);

    match Brain::from_config(&config.brain) {
        Ok(brain) => {
            println!("providers: {}", brain.provider_names().join(" -> "));
        }
        Err(e) => println!("providers: unavailable ({e})"),
    }

    match MemoryStore::open(config.memory_db_path(), config.memory.max_messages) {
        Ok(store) => {
            let count = store.message_count().await.unwrap_or(0);
            println!(
                "memory: {} messages at {}",
                count,
                config.memory_db_path().display()
            );
        }
        Err(e) => println!("memory: unavailable ({e})"),
    }

    println!(
        "autonomy: {} (interval {}s, threshold {:.2})",
        if config.autonomy.enabled { "enabled" } else { "disabled" },
        config.autonomy.interval_secs,
        config.autonomy.confidence_threshold,
    );
    println!(
        "stt: trigger {}ms, release {}ms, idle timeout {}ms, vad {}",
        config.stt.trigger_threshold_ms,
        config.stt.release_threshold_ms,
        config.stt.idle_timeout_ms,
        if config.stt.vad_enabled { "on" } else { "off" },
    );

    Ok(())
}
