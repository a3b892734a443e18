//! Voice activity gate
//!
//! Classifies each captured frame as speech or non-speech so the transcriber
//! only feeds the recognizer during speech windows. Detection is RMS energy
//! against an adaptive noise floor.
//!
//! The gate fails open: any internal failure permanently disables it for the
//! rest of the process and every later frame classifies as speech. Silence
//! misread as speech only wastes recognizer cycles; speech misread as silence
//! loses user input.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Energy threshold in dB above the noise floor
const ENERGY_THRESHOLD_DB: f32 = 9.0;

/// Noise floor adaptation rate (0.0-1.0)
const ADAPTATION_RATE: f32 = 0.05;

/// Voice activity gate wrapping the energy detector
pub struct VoiceGate {
    detector: Mutex<EnergyDetector>,
    /// Set once on internal failure; the gate then always reports speech
    disabled: AtomicBool,
    enabled_by_config: bool,
}

struct EnergyDetector {
    noise_floor: f32,
    frames_seen: u64,
}

impl VoiceGate {
    /// Create a gate. When `enabled` is false the gate reports speech for
    /// every frame (no gating), matching the disabled/fail-open behavior.
    pub fn new(enabled: bool) -> Self {
        Self {
            detector: Mutex::new(EnergyDetector {
                noise_floor: 1e-10,
                frames_seen: 0,
            }),
            disabled: AtomicBool::new(false),
            enabled_by_config: enabled,
        }
    }

    /// Classify one PCM frame. Never panics and never errors; failures
    /// disable the gate for the process lifetime.
    pub fn classify(&self, frame: &[i16]) -> bool {
        if !self.enabled_by_config || self.disabled.load(Ordering::Relaxed) {
            return true;
        }

        match self.classify_inner(frame) {
            Ok(is_speech) => is_speech,
            Err(reason) => {
                warn!("Voice gate failure ({reason}); disabling gate, reporting all frames as speech");
                self.disabled.store(true, Ordering::Relaxed);
                true
            }
        }
    }

    fn classify_inner(&self, frame: &[i16]) -> Result<bool, &'static str> {
        if frame.is_empty() {
            return Ok(false);
        }

        let energy = rms_energy(frame);
        if !energy.is_finite() {
            return Err("non-finite frame energy");
        }

        let mut det = self.detector.lock().map_err(|_| "poisoned detector lock")?;
        det.frames_seen += 1;

        let threshold = det.noise_floor * 10f32.powf(ENERGY_THRESHOLD_DB / 10.0);
        let is_speech = energy > threshold;

        // Only non-speech frames feed the floor, so speech never raises it
        if !is_speech {
            det.noise_floor =
                det.noise_floor * (1.0 - ADAPTATION_RATE) + energy * ADAPTATION_RATE;
        }

        if det.frames_seen % 500 == 0 {
            debug!(
                "Voice gate: noise_floor={:.2e}, last_energy={:.2e}",
                det.noise_floor, energy
            );
        }

        Ok(is_speech)
    }

    /// Whether the gate has permanently failed open
    pub fn is_disabled(&self) -> bool {
        !self.enabled_by_config || self.disabled.load(Ordering::Relaxed)
    }

    /// Reset the adaptive noise floor (new capture session)
    pub fn reset(&self) {
        if let Ok(mut det) = self.detector.lock() {
            det.noise_floor = 1e-10;
            det.frames_seen = 0;
        }
    }
}

/// RMS energy of a PCM frame, normalized to [-1, 1] samples
fn rms_energy(frame: &[i16]) -> f32 {
    let sum_sq: f32 = frame
        .iter()
        .map(|&s| {
            let f = s as f32 / 32768.0;
            f * f
        })
        .sum();
    (sum_sq / frame.len() as f32).sqrt()
}
