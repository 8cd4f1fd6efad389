//! Streaming transcription sessions
//!
//! A session owns one connection to the streaming backend for the
//! duration of a single utterance. The orchestrator talks to it through
//! a [`SessionHandle`]: audio frames go down one channel, control
//! requests down another, and everything coming back (transcripts,
//! closure, failure) arrives as [`SessionEvent`]s on the channel the
//! orchestrator supplied when opening the session.
//!
//! The [`SessionBackend`] trait is the seam that lets the orchestrator
//! be tested against a scripted backend instead of a live socket.

pub mod fallback;
pub mod protocol;
pub mod streaming;

pub use protocol::{TranscriptEvent, TranscriptKind};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{FallbackConfig, StreamingConfig};
use crate::error::SessionError;
use fallback::BatchTranscriber;

/// Control requests sent to a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Begin the graceful shutdown handshake: finalize, wait (bounded)
    /// for the acknowledgement, then close
    Finish,
    /// Tear the session down without waiting for anything
    Cancel,
}

/// Events a session reports back to the orchestrator
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Transcript(TranscriptEvent),
    /// The session completed its shutdown handshake (or was cancelled)
    /// and released its connection
    Closed,
    /// The session is dead; no further events will follow
    Failed(SessionError),
}

/// Handle to a running session. Dropping the handle closes both channels,
/// which the session treats as a cancel.
pub struct SessionHandle {
    pub frame_tx: mpsc::Sender<Vec<f32>>,
    pub control_tx: mpsc::UnboundedSender<SessionControl>,
}

impl SessionHandle {
    /// Request the graceful finish handshake. Returns false if the
    /// session task has already exited.
    pub fn finish(&self) -> bool {
        self.control_tx.send(SessionControl::Finish).is_ok()
    }

    pub fn cancel(&self) -> bool {
        self.control_tx.send(SessionControl::Cancel).is_ok()
    }
}

/// Seam between the orchestrator and the transcription transport
pub trait SessionBackend: Send + Sync {
    /// Spawn a streaming session task. Events are delivered on
    /// `event_tx`; the returned handle feeds it audio and control.
    fn open(&self, session_id: Uuid, event_tx: mpsc::Sender<SessionEvent>) -> SessionHandle;

    /// One-shot batch transcription of a complete recording. Blocking;
    /// callers run it on a blocking thread.
    fn batch_transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, SessionError>;

    /// Whether a batch fallback endpoint is configured
    fn has_fallback(&self) -> bool;
}

/// Production backend: WebSocket streaming with optional HTTP batch fallback
pub struct TransportBackend {
    streaming: StreamingConfig,
    api_key: Option<String>,
    fallback: Option<BatchTranscriber>,
}

impl TransportBackend {
    pub fn new(
        streaming: StreamingConfig,
        api_key: Option<String>,
        fallback: &FallbackConfig,
    ) -> Self {
        Self {
            streaming,
            api_key,
            fallback: BatchTranscriber::from_config(fallback),
        }
    }
}

impl SessionBackend for TransportBackend {
    fn open(&self, session_id: Uuid, event_tx: mpsc::Sender<SessionEvent>) -> SessionHandle {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let config = self.streaming.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            streaming::run_session(config, api_key, session_id, frame_rx, control_rx, event_tx)
                .await;
        });
        SessionHandle {
            frame_tx,
            control_tx,
        }
    }

    fn batch_transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, SessionError> {
        match &self.fallback {
            Some(batch) => batch.transcribe(samples, sample_rate),
            None => Err(SessionError::NoFallback),
        }
    }

    fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}
