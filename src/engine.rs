//! Dictation orchestration engine
//!
//! A single-writer actor that owns the dictation state machine. All
//! inputs converge on one bounded channel as [`EngineEvent`]s: hotkey
//! presses, signal-driven start/stop requests, capture events, session
//! events, fallback results, and the per-session timeout. The actor is
//! the only task that mutates state, so every transition is a plain
//! sequential step with no locking.
//!
//! Workflow: Idle -> Listening (device open, VAD armed) -> Recording
//! (speech detected, frames streaming) -> Transcribing (finish
//! handshake or batch fallback) -> Refining -> Done -> Idle. Error is
//! reachable from any non-Idle state and returns to Idle after the
//! failure is surfaced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::{AudioCapture, CaptureEvent, CaptureFactory};
use crate::config::{BindingMode, Config};
use crate::error::SessionError;
use crate::hotkey::{HotkeyEvent, KeyAction};
use crate::refine::{detect_context, RefinePipeline};
use crate::session::{SessionBackend, SessionEvent, SessionHandle, TranscriptKind};
use crate::state::{DictationSession, DictationState};
use crate::ui::{UiHandle, UiPayload, UiUpdate};

/// Everything that can drive the state machine
#[derive(Debug)]
pub enum EngineEvent {
    Hotkey(HotkeyEvent),
    /// External start request (SIGUSR1); behaves like a toggle press
    StartRequested,
    /// External stop request (SIGUSR2); behaves like a toggle release
    StopRequested,
    Capture(Uuid, CaptureEvent),
    Session(Uuid, SessionEvent),
    /// The per-session recording cap expired
    MaxDuration(Uuid),
    /// Result of a spawned batch fallback transcription
    FallbackResult(Uuid, Result<String, SessionError>),
    /// Refined text coming back from the spawned refine task
    RefineResult(Uuid, String),
}

/// Collaborators the engine drives. The trait objects are the seams
/// that let the scenario tests run the full state machine against
/// scripted capture and transport.
pub struct EngineDeps {
    pub capture_factory: CaptureFactory,
    pub backend: Arc<dyn SessionBackend>,
    pub ui: UiHandle,
    pub refine: Arc<dyn RefinePipeline>,
}

struct ActiveSession {
    session: DictationSession,
    capture: Box<dyn AudioCapture>,
    handle: SessionHandle,
    finals: Vec<String>,
    /// Frames that could not be handed to the streaming transport
    lost_stream_frames: u64,
}

impl ActiveSession {
    /// True when the streaming transcript cannot be trusted: either the
    /// transport died, or frames never reached it. The retained buffer
    /// goes to the batch fallback instead.
    fn stream_incomplete(&self) -> bool {
        self.session.streaming_failed || self.lost_stream_frames > 0
    }
}

pub struct Engine {
    config: Config,
    deps: EngineDeps,
    tx: mpsc::Sender<EngineEvent>,
    state: DictationState,
    active: Option<ActiveSession>,
}

impl Engine {
    /// Create the engine and its event channel. The returned sender is
    /// what hotkey listeners and signal handlers feed.
    pub fn new(config: Config, deps: EngineDeps) -> (Self, mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let engine = Self {
            config,
            deps,
            tx: tx.clone(),
            state: DictationState::Idle,
            active: None,
        };
        (engine, tx, rx)
    }

    pub fn state(&self) -> DictationState {
        self.state
    }

    /// Run the actor loop until shutdown is signalled and any active
    /// session has been torn down
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("engine shutting down");
                        self.abort_active("daemon shutting down").await;
                        break;
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Hotkey(hotkey) => self.handle_hotkey(hotkey).await,
            EngineEvent::StartRequested => {
                if self.state == DictationState::Idle {
                    self.start_session(BindingMode::Toggle).await;
                } else {
                    debug!(state = %self.state, "ignoring external start request");
                }
            }
            EngineEvent::StopRequested => {
                // Stop is idempotent: without an active recording there
                // is nothing to do. Unlike hotkeys, external stop does
                // not care which binding started the session.
                if matches!(
                    self.state,
                    DictationState::Listening | DictationState::Recording
                ) {
                    self.stop_session().await;
                } else {
                    debug!(state = %self.state, "ignoring external stop request");
                }
            }
            EngineEvent::Capture(id, capture) => self.handle_capture(id, capture).await,
            EngineEvent::Session(id, session) => self.handle_session(id, session).await,
            EngineEvent::MaxDuration(id) => {
                if self.is_current(id)
                    && matches!(
                        self.state,
                        DictationState::Listening | DictationState::Recording
                    )
                {
                    info!(
                        max_duration_secs = self.config.audio.max_duration_secs,
                        "maximum recording duration reached, stopping"
                    );
                    self.stop_session().await;
                }
            }
            EngineEvent::FallbackResult(id, result) => {
                if !self.is_current(id) || self.state != DictationState::Transcribing {
                    return;
                }
                match result {
                    Ok(text) => self.deliver(text).await,
                    Err(e) => self.fail_session(&e.to_string()).await,
                }
            }
            EngineEvent::RefineResult(id, refined) => {
                if self.is_current(id) && self.state == DictationState::Refining {
                    self.finish_delivery(refined);
                }
            }
        }
    }

    async fn handle_hotkey(&mut self, event: HotkeyEvent) {
        match (event.action, event.mode) {
            (KeyAction::Pressed, mode) => {
                if self.state == DictationState::Idle {
                    self.start_session(mode).await;
                } else if mode == BindingMode::Toggle && self.recording_active(BindingMode::Toggle)
                {
                    self.stop_session().await;
                } else {
                    debug!(state = %self.state, ?mode, "ignoring hotkey press");
                }
            }
            (KeyAction::Released, BindingMode::Hold) => {
                if self.recording_active(BindingMode::Hold) {
                    self.stop_session().await;
                } else {
                    debug!(state = %self.state, "ignoring hold release");
                }
            }
            // Toggle bindings act on press only
            (KeyAction::Released, BindingMode::Toggle) => {}
        }
    }

    /// Whether an active session in Listening or Recording was started
    /// by the given binding mode. Sessions ignore control events from
    /// the other mode so hold and toggle bindings cannot interfere.
    fn recording_active(&self, mode: BindingMode) -> bool {
        matches!(
            self.state,
            DictationState::Listening | DictationState::Recording
        ) && self
            .active
            .as_ref()
            .is_some_and(|a| a.session.started_by == mode)
    }

    fn is_current(&self, id: Uuid) -> bool {
        self.active.as_ref().is_some_and(|a| a.session.id == id)
    }

    fn set_state(&mut self, state: DictationState) {
        if self.state == state {
            return;
        }
        let session_id = self.active.as_ref().map(|a| a.session.id);
        debug!(session_id = ?session_id, from = %self.state, to = %state, "state transition");
        self.state = state;
        if let Some(active) = self.active.as_mut() {
            active.session.state = state;
        }
        self.deps.ui.state_changed(state);
    }

    async fn start_session(&mut self, mode: BindingMode) {
        let session = DictationSession::new(mode);
        let id = session.id;
        info!(session_id = %id, ?mode, "starting dictation session");

        let mut capture = match (self.deps.capture_factory)(&self.config.audio) {
            Ok(capture) => capture,
            Err(e) => {
                self.surface_start_failure(&e.to_string());
                return;
            }
        };
        let mut capture_rx = match capture.start().await {
            Ok(rx) => rx,
            Err(e) => {
                self.surface_start_failure(&e.to_string());
                return;
            }
        };

        // Session events come back through the engine channel so this
        // actor stays the single writer.
        let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(64);
        let handle = self.deps.backend.open(id, event_tx);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if tx.send(EngineEvent::Session(id, event)).await.is_err() {
                    break;
                }
            }
        });

        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = capture_rx.recv().await {
                if tx.send(EngineEvent::Capture(id, event)).await.is_err() {
                    break;
                }
            }
        });

        let tx = self.tx.clone();
        let max_duration = Duration::from_secs(self.config.audio.max_duration_secs.into());
        tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            let _ = tx.send(EngineEvent::MaxDuration(id)).await;
        });

        self.active = Some(ActiveSession {
            session,
            capture,
            handle,
            finals: Vec::new(),
            lost_stream_frames: 0,
        });
        self.set_state(DictationState::Listening);
    }

    fn surface_start_failure(&mut self, message: &str) {
        error!(%message, "failed to start dictation session");
        self.deps.ui.publish(UiUpdate {
            state: DictationState::Error,
            payload: UiPayload::Error(message.to_string()),
        });
        self.state = DictationState::Idle;
        self.deps.ui.state_changed(DictationState::Idle);
        self.active = None;
    }

    async fn handle_capture(&mut self, id: Uuid, event: CaptureEvent) {
        if !self.is_current(id) {
            return;
        }
        match event {
            CaptureEvent::SpeechStarted => {
                if self.state == DictationState::Listening {
                    self.set_state(DictationState::Recording);
                }
            }
            CaptureEvent::Frame(frame) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                // Every frame is retained in arrival order, so the
                // batch fallback gets the byte-identical recording.
                let samples = frame.samples.clone();
                active.session.frames.push(frame);
                if !active.session.streaming_failed {
                    match active.handle.frame_tx.try_send(samples) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            active.lost_stream_frames += 1;
                            warn!(
                                session_id = %id,
                                lost = active.lost_stream_frames,
                                "streaming transport stalled, frame not forwarded"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            warn!(session_id = %id, "streaming frame channel closed");
                            active.session.streaming_failed = true;
                        }
                    }
                }
            }
            CaptureEvent::Level(level) => {
                if matches!(
                    self.state,
                    DictationState::Listening | DictationState::Recording
                ) {
                    self.deps.ui.publish(UiUpdate {
                        state: self.state,
                        payload: UiPayload::Level(level),
                    });
                }
            }
        }
    }

    async fn handle_session(&mut self, id: Uuid, event: SessionEvent) {
        if !self.is_current(id) {
            return;
        }
        match event {
            SessionEvent::Transcript(transcript) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                match transcript.kind {
                    TranscriptKind::Interim => {
                        active.session.interim = transcript.text.clone();
                        if matches!(
                            self.state,
                            DictationState::Recording | DictationState::Transcribing
                        ) {
                            self.deps.ui.publish(UiUpdate {
                                state: self.state,
                                payload: UiPayload::Interim(transcript.text),
                            });
                        }
                    }
                    TranscriptKind::Final => {
                        debug!(session_id = %id, text = %transcript.text, "final segment");
                        active.finals.push(transcript.text);
                    }
                }
            }
            SessionEvent::Failed(e) => match self.state {
                DictationState::Listening | DictationState::Recording => {
                    // Capture continues; the retained frames go to the
                    // batch fallback when the recording ends.
                    warn!(session_id = %id, error = %e, "streaming session failed mid-recording, will fall back to batch");
                    if let Some(active) = self.active.as_mut() {
                        active.session.streaming_failed = true;
                    }
                }
                DictationState::Transcribing => {
                    warn!(session_id = %id, error = %e, "streaming session failed during finish");
                    self.start_fallback().await;
                }
                _ => {
                    debug!(session_id = %id, error = %e, "late session failure ignored");
                }
            },
            SessionEvent::Closed => {
                if self.state != DictationState::Transcribing {
                    debug!(session_id = %id, "session closed outside Transcribing, ignoring");
                    return;
                }
                let Some(active) = self.active.as_ref() else {
                    return;
                };
                if active.stream_incomplete() {
                    self.start_fallback().await;
                    return;
                }
                let text = if active.finals.is_empty() {
                    active.session.interim.clone()
                } else {
                    active.finals.join(" ")
                };
                self.deliver(text).await;
            }
        }
    }

    /// End the recording phase: release the device, then either run the
    /// finish handshake or go straight to the batch fallback
    async fn stop_session(&mut self) {
        let was_listening = self.state == DictationState::Listening;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let id = active.session.id;

        if let Err(e) = active.capture.stop().await {
            warn!(session_id = %id, error = %e, "audio capture did not stop cleanly");
        }

        if was_listening {
            // No speech was ever detected; nothing to transcribe.
            info!(session_id = %id, "stopped before speech onset, discarding");
            active.handle.cancel();
            self.active = None;
            self.set_state(DictationState::Idle);
            return;
        }

        info!(
            session_id = %id,
            frames = active.session.frames.len(),
            duration_secs = %format!("{:.2}", active.session.elapsed().as_secs_f32()),
            "recording stopped"
        );
        let stream_incomplete = active.stream_incomplete();
        if active.lost_stream_frames > 0 {
            warn!(
                session_id = %id,
                lost = active.lost_stream_frames,
                "streaming transport missed frames, using the retained recording"
            );
        }
        self.set_state(DictationState::Transcribing);

        if stream_incomplete {
            self.start_fallback().await;
            return;
        }
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !active.handle.finish() {
            // Session task is already gone; its Failed event either
            // arrived (streaming_failed) or is about to.
            warn!(session_id = %id, "session task gone before finish, using fallback");
            self.start_fallback().await;
        }
    }

    /// Hand the retained recording to the batch fallback
    async fn start_fallback(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let id = active.session.id;
        active.handle.cancel();

        if active.session.frames.is_empty() {
            self.fail_session("no audio was captured before the transport failed")
                .await;
            return;
        }
        if !self.deps.backend.has_fallback() {
            self.fail_session(&SessionError::NoFallback.to_string())
                .await;
            return;
        }

        info!(
            session_id = %id,
            samples = active.session.sample_count(),
            "submitting retained audio to batch fallback"
        );
        let samples = active.session.contiguous_samples();
        let sample_rate = self.config.audio.sample_rate;
        let backend = Arc::clone(&self.deps.backend);
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = backend.batch_transcribe(&samples, sample_rate);
            let _ = tx.blocking_send(EngineEvent::FallbackResult(id, result));
        });
    }

    /// Refine and publish the final text, then return to Idle. The
    /// refine command runs in a spawned task so a slow hook never
    /// blocks the event loop; its output comes back as a RefineResult.
    async fn deliver(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            info!("transcription produced no text");
            self.active = None;
            // An empty result still passes through Done; Transcribing
            // never transitions straight to Idle.
            self.set_state(DictationState::Done);
            self.set_state(DictationState::Idle);
            return;
        }

        if !self.deps.refine.is_active() {
            self.finish_delivery(text);
            return;
        }

        let Some(active) = self.active.as_ref() else {
            return;
        };
        let id = active.session.id;
        self.set_state(DictationState::Refining);
        let refine = Arc::clone(&self.deps.refine);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let context = detect_context(&text);
            let refined = refine.refine(&text, context).await;
            let _ = tx.send(EngineEvent::RefineResult(id, refined)).await;
        });
    }

    fn finish_delivery(&mut self, text: String) {
        if let Some(active) = self.active.as_mut() {
            active.session.final_text = Some(text.clone());
        }
        self.set_state(DictationState::Done);
        self.deps.ui.publish(UiUpdate {
            state: DictationState::Done,
            payload: UiPayload::Final(text),
        });
        self.active = None;
        self.set_state(DictationState::Idle);
    }

    async fn fail_session(&mut self, message: &str) {
        error!(%message, "dictation session failed");
        if let Some(active) = self.active.as_mut() {
            active.session.error = Some(message.to_string());
            active.handle.cancel();
        }
        self.set_state(DictationState::Error);
        self.deps.ui.publish(UiUpdate {
            state: DictationState::Error,
            payload: UiPayload::Error(message.to_string()),
        });
        self.active = None;
        self.set_state(DictationState::Idle);
    }

    /// Tear down any active session without transcription
    async fn abort_active(&mut self, reason: &str) {
        if let Some(mut active) = self.active.take() {
            info!(session_id = %active.session.id, %reason, "aborting active session");
            if let Err(e) = active.capture.stop().await {
                warn!(error = %e, "audio capture did not stop cleanly");
            }
            active.handle.cancel();
        }
        self.set_state(DictationState::Idle);
    }
}
