//! Dictation state machine data model
//!
//! Defines the states for the dictation workflow:
//! Idle → Listening → Recording → Transcribing → (Refining) → Done → Idle
//! with Error reachable from any non-Idle state.

use crate::audio::AudioFrame;
use std::time::Instant;
use uuid::Uuid;

/// State of the dictation workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictationState {
    /// Waiting for a hotkey start event
    Idle,
    /// Device open, VAD waiting for speech onset
    Listening,
    /// Speech detected, frames streaming to the backend
    Recording,
    /// Stop requested, waiting for the final transcript
    Transcribing,
    /// Final transcript handed to the refine pipeline
    Refining,
    /// Final text ready; returns to Idle after delivery
    Done,
    /// Unrecoverable failure; returns to Idle after delivery
    Error,
}

impl DictationState {
    /// Short lowercase name used in the state file and notifications
    pub fn name(&self) -> &'static str {
        match self {
            DictationState::Idle => "idle",
            DictationState::Listening => "listening",
            DictationState::Recording => "recording",
            DictationState::Transcribing => "transcribing",
            DictationState::Refining => "refining",
            DictationState::Done => "done",
            DictationState::Error => "error",
        }
    }
}

impl std::fmt::Display for DictationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One dictation attempt, from Listening entry to Done/Error delivery.
/// Exactly one may be active per daemon process.
#[derive(Debug)]
pub struct DictationSession {
    /// Unique session id, for log correlation
    pub id: Uuid,
    /// Current state
    pub state: DictationState,
    /// When the session entered Listening
    pub started_at: Instant,
    /// Which binding mode started the session; control events from the
    /// other mode are ignored so hold and toggle bindings do not interfere
    pub started_by: crate::config::BindingMode,
    /// Every captured frame in arrival order, retained so a mid-session
    /// transport failure can hand the byte-identical audio to the fallback
    pub frames: Vec<AudioFrame>,
    /// Accumulated interim transcript (superseded, never edited)
    pub interim: String,
    /// Final transcript once the backend delivers it
    pub final_text: Option<String>,
    /// Terminal error, if the session failed
    pub error: Option<String>,
    /// Whether the streaming transport has failed for this session
    pub streaming_failed: bool,
}

impl DictationSession {
    /// Create a session on Listening entry
    pub fn new(started_by: crate::config::BindingMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: DictationState::Listening,
            started_at: Instant::now(),
            started_by,
            frames: Vec::new(),
            interim: String::new(),
            final_text: None,
            error: None,
            streaming_failed: false,
        }
    }

    /// Elapsed time since Listening entry
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Total captured samples across all retained frames
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(|f| f.samples.len()).sum()
    }

    /// Flatten the retained frames into one contiguous buffer, preserving
    /// arrival order exactly
    pub fn contiguous_samples(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.sample_count());
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }
}
