//! Activation signals
//!
//! Two ways into a listening session: a hotkey press and a detected wake
//! phrase. Both are normalized to the same [`TriggerEvent`] and submitted to
//! the session task through one channel, so the state machine has a single
//! entry point for activation regardless of source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WakeConfig;

/// Where a trigger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Hotkey,
    WakePhrase,
}

/// One activation event consumed by the session controller
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    pub source: TriggerSource,
}

impl TriggerEvent {
    pub fn hotkey() -> Self {
        Self {
            source: TriggerSource::Hotkey,
        }
    }

    pub fn wake_phrase() -> Self {
        Self {
            source: TriggerSource::WakePhrase,
        }
    }
}

/// Case-insensitive wake phrase matcher applied to recognized text
pub struct WakePhraseDetector {
    phrases: Vec<String>,
}

impl WakePhraseDetector {
    pub fn new(config: &WakeConfig) -> Self {
        Self {
            phrases: config.phrases.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// True when any configured phrase appears in `text`
    pub fn matches(&self, text: &str) -> bool {
        if self.phrases.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        self.phrases.iter().any(|p| lowered.contains(p.as_str()))
    }
}

/// Keyboard listener on a dedicated thread. Each press of the configured key
/// submits one trigger event; key handling must never block the session task.
pub struct HotkeyListener {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HotkeyListener {
    pub fn spawn(hotkey: char, tx: mpsc::Sender<TriggerEvent>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("hotkey-listener".to_string())
            .spawn(move || hotkey_loop(hotkey, tx, thread_stop))
            .expect("Failed to spawn hotkey listener thread");

        info!("Hotkey listener started (press '{}' to speak)", hotkey);
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn hotkey_loop(hotkey: char, tx: mpsc::Sender<TriggerEvent>, stop: Arc<AtomicBool>) {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind};

    while !stop.load(Ordering::SeqCst) {
        match event::poll(Duration::from_millis(200)) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                    let pressed = match key.code {
                        KeyCode::Char(c) => c == hotkey,
                        KeyCode::Enter => hotkey == '\n',
                        _ => false,
                    };
                    if pressed {
                        debug!("Hotkey pressed");
                        // Full queue means an unhandled trigger is already
                        // pending; dropping this one is fine.
                        if tx.try_send(TriggerEvent::hotkey()).is_err() {
                            debug!("Trigger queue full; dropping hotkey event");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Hotkey listener read error: {e}");
                    std::thread::sleep(Duration::from_millis(500));
                }
            },
            Ok(false) => {}
            Err(e) => {
                warn!("Hotkey listener unavailable: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(phrases: &[&str]) -> WakePhraseDetector {
        WakePhraseDetector::new(&WakeConfig {
            phrases: phrases.iter().map(|s| s.to_string()).collect(),
            ..WakeConfig::default()
        })
    }

    #[test]
    fn test_wake_phrase_match_case_insensitive() {
        let det = detector(&["hey aria"]);
        assert!(det.matches("Hey Aria, what's the weather"));
        assert!(det.matches("i said HEY ARIA"));
        assert!(!det.matches("hey there"));
    }

    #[test]
    fn test_wake_phrase_no_phrases_never_matches() {
        let det = detector(&[]);
        assert!(!det.matches("hey aria"));
    }

    #[test]
    fn test_trigger_event_sources() {
        assert_eq!(TriggerEvent::hotkey().source, TriggerSource::Hotkey);
        assert_eq!(TriggerEvent::wake_phrase().source, TriggerSource::WakePhrase);
    }
}
