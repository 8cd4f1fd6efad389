//! Audio capture module
//!
//! Owns the microphone via cpal (works with PipeWire, PulseAudio, ALSA),
//! runs energy VAD with a pre-roll buffer, and hands fixed-size frames to
//! the engine through a bounded queue. The capture side never touches the
//! network.

pub mod cpal_capture;
pub mod level;
pub mod vad;

use crate::config::AudioConfig;
use crate::error::AudioError;
use std::time::Instant;
use tokio::sync::mpsc;

/// One fixed-size chunk of captured audio (f32, mono, target sample rate).
/// Frames carry monotonically increasing sequence numbers and are delivered
/// in strict order with no duplication.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Sequence number, starting at 0 per capture
    pub seq: u64,
    /// Raw samples
    pub samples: Vec<f32>,
    /// When the frame left the audio callback
    pub captured_at: Instant,
}

/// Events emitted by an active capture
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// VAD triggered; the pre-roll frames follow immediately as Frame events
    SpeechStarted,
    /// One captured frame (only emitted after SpeechStarted)
    Frame(AudioFrame),
    /// Normalized input level in [0, 1], emitted at a fixed cadence from
    /// the moment the device opens (also while waiting for speech)
    Level(f32),
}

/// Trait for audio capture implementations
#[async_trait::async_trait]
pub trait AudioCapture: Send {
    /// Open the device and start capturing.
    /// Returns the event channel; Level events begin immediately, Frame
    /// events begin once VAD detects speech.
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, AudioError>;

    /// Stop capturing and release the device
    async fn stop(&mut self) -> Result<(), AudioError>;
}

/// Factory type the engine uses to open a capture, kept as a seam so
/// tests can substitute a scripted capture
pub type CaptureFactory =
    Box<dyn Fn(&AudioConfig) -> Result<Box<dyn AudioCapture>, AudioError> + Send + Sync>;

/// Default factory producing a cpal-backed capture
pub fn create_capture(config: &AudioConfig) -> Result<Box<dyn AudioCapture>, AudioError> {
    Ok(Box::new(cpal_capture::CpalCapture::new(config)?))
}
