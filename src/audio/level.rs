//! Normalized input level stream
//!
//! Produces one level sample per fixed interval for visualization
//! consumers. The contract here is the raw signal only: values are always
//! in [0, 1] and never NaN/Inf. Smoothing and auto-gain belong to the
//! presentation layer.

use super::vad::rms;

/// Accumulates samples and emits a bounded, NaN-free level value once per
/// configured interval
pub struct LevelMeter {
    samples_per_interval: usize,
    pending: Vec<f32>,
}

impl LevelMeter {
    pub fn new(interval_ms: u32, sample_rate: u32) -> Self {
        let samples_per_interval =
            ((sample_rate as usize * interval_ms as usize) / 1000).max(1);
        Self {
            samples_per_interval,
            pending: Vec::new(),
        }
    }

    /// Feed captured samples; returns a level for each completed interval.
    /// Usually zero or one value, more if the input spans several intervals.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.samples_per_interval {
            let chunk: Vec<f32> = self.pending.drain(..self.samples_per_interval).collect();
            out.push(normalize(rms(&chunk)));
        }
        out
    }
}

/// Map an RMS value onto [0, 1], scrubbing invalid values.
/// Full-scale speech peaks around 0.35 RMS, so scale accordingly.
fn normalize(rms: f32) -> f32 {
    if !rms.is_finite() {
        return 0.0;
    }
    (rms / 0.35).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_once_per_interval() {
        // 50ms at 16kHz = 800 samples per level
        let mut meter = LevelMeter::new(50, 16000);
        assert!(meter.push(&vec![0.1; 700]).is_empty());
        let levels = meter.push(&vec![0.1; 100]);
        assert_eq!(levels.len(), 1);
    }

    #[test]
    fn test_multiple_intervals_in_one_push() {
        let mut meter = LevelMeter::new(50, 16000);
        let levels = meter.push(&vec![0.1; 2400]);
        assert_eq!(levels.len(), 3);
    }

    #[test]
    fn test_levels_are_bounded() {
        let mut meter = LevelMeter::new(50, 16000);
        for level in meter.push(&vec![10.0; 800]) {
            assert!((0.0..=1.0).contains(&level));
        }
        for level in meter.push(&vec![0.0; 800]) {
            assert_eq!(level, 0.0);
        }
    }

    #[test]
    fn test_nan_input_produces_valid_levels() {
        let mut meter = LevelMeter::new(50, 16000);
        let mut samples = vec![f32::NAN; 400];
        samples.extend(vec![f32::NEG_INFINITY; 400]);
        for level in meter.push(&samples) {
            assert!(level.is_finite());
            assert!((0.0..=1.0).contains(&level));
        }
    }

    #[test]
    fn test_silence_maps_to_zero() {
        let mut meter = LevelMeter::new(50, 16000);
        let levels = meter.push(&vec![0.0; 800]);
        assert_eq!(levels, vec![0.0]);
    }
}
