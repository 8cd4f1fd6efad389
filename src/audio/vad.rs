//! Energy-based voice activity detection with pre-roll
//!
//! A simple RMS-energy VAD run incrementally per frame. Energy thresholds
//! necessarily lag true speech onset, so a rolling pre-roll buffer keeps
//! the most recent samples and is drained into the outgoing stream when
//! the trigger fires, preventing the first syllable from being clipped.

use crate::config::VadConfig;
use std::collections::VecDeque;

/// Incremental energy VAD
///
/// Feed frames with [`push`](EnergyVad::push); it returns `true` exactly
/// once, on the frame where sustained speech is first detected.
pub struct EnergyVad {
    /// RMS energy above which a frame counts as speech
    threshold: f32,
    /// Consecutive speech frames required before triggering
    trigger_frames: u32,
    /// Consecutive speech frames observed so far
    run: u32,
    /// Whether the trigger has already fired
    triggered: bool,
}

impl EnergyVad {
    pub fn new(config: &VadConfig, frame_ms: u32) -> Self {
        let threshold = map_threshold_to_energy(config.threshold);
        let trigger_frames = (config.min_speech_ms / frame_ms.max(1)).max(1);
        Self {
            threshold,
            trigger_frames,
            run: 0,
            triggered: false,
        }
    }

    /// Process one frame. Returns true on the frame where speech onset is
    /// first confirmed; false before and after.
    pub fn push(&mut self, samples: &[f32]) -> bool {
        if self.triggered {
            return false;
        }
        if rms(samples) >= self.threshold {
            self.run += 1;
            if self.run >= self.trigger_frames {
                self.triggered = true;
                return true;
            }
        } else {
            self.run = 0;
        }
        false
    }

    pub fn has_triggered(&self) -> bool {
        self.triggered
    }
}

/// RMS energy of a sample slice. Non-finite samples count as silence.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| if s.is_finite() { s * s } else { 0.0 })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Map config threshold (0.0-1.0) to an RMS energy threshold
///
/// - 0.0 = very sensitive (energy threshold ~0.001, detects quiet whispers)
/// - 0.5 = balanced (energy threshold ~0.01, filters silence)
/// - 1.0 = aggressive (energy threshold ~0.1, requires louder speech)
fn map_threshold_to_energy(config_threshold: f32) -> f32 {
    let t = config_threshold.clamp(0.0, 1.0);
    0.001 * (100.0_f32).powf(t)
}

/// Rolling buffer of the most recent samples, retained continuously so
/// audio preceding a VAD trigger is not lost
pub struct PrerollBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl PrerollBuffer {
    /// `preroll_ms` worth of samples at `sample_rate`
    pub fn new(preroll_ms: u32, sample_rate: u32) -> Self {
        let capacity = (sample_rate as usize * preroll_ms as usize) / 1000;
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(s);
        }
    }

    /// Take the buffered samples in capture order, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<f32> {
        self.samples.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
