//! End-to-end state machine scenarios against scripted capture and
//! transport, exercising the full hotkey -> capture -> session ->
//! delivery pipeline without touching a microphone or a socket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use voxstream::audio::{AudioCapture, AudioFrame, CaptureEvent};
use voxstream::config::{BindingMode, Config};
use voxstream::engine::{Engine, EngineDeps, EngineEvent};
use voxstream::error::{AudioError, SessionError};
use voxstream::hotkey::{HotkeyEvent, KeyAction};
use voxstream::refine::{ContextTag, NoRefine, RefinePipeline};
use voxstream::session::{
    SessionBackend, SessionEvent, SessionHandle, TranscriptEvent, TranscriptKind,
};
use voxstream::state::DictationState;
use voxstream::ui::{UiDispatcher, UiPayload, UiSink, UiUpdate};

// ---------------------------------------------------------------------
// Scripted collaborators

/// Capture that replays a fixed event script and then stays open
struct ScriptedCapture {
    events: Vec<CaptureEvent>,
    // Kept so the event channel stays open until stop()
    keepalive: Option<mpsc::Sender<CaptureEvent>>,
}

#[async_trait::async_trait]
impl AudioCapture for ScriptedCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, AudioError> {
        let (tx, rx) = mpsc::channel(64);
        for event in self.events.drain(..) {
            tx.send(event).await.map_err(|_| AudioError::Stream("send".into()))?;
        }
        self.keepalive = Some(tx);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), AudioError> {
        self.keepalive = None;
        Ok(())
    }
}

/// How the scripted transport behaves for a session
#[derive(Clone)]
enum Transport {
    /// Deliver these transcripts when asked to finish, then close
    Healthy(Vec<TranscriptEvent>),
    /// Never drain the frame channel (capacity 1), so most frames
    /// cannot be handed over; still answer finish with these
    Stalled(Vec<TranscriptEvent>),
    /// Die as soon as the session opens
    FailImmediately,
    /// Accept everything, then die when asked to finish
    FailOnFinish,
}

struct ScriptedBackend {
    transport: Transport,
    /// None disables the fallback path
    batch_result: Option<String>,
    batch_samples: Mutex<Option<Vec<f32>>>,
    streamed_samples: Arc<Mutex<Vec<f32>>>,
}

impl ScriptedBackend {
    fn new(transport: Transport, batch_result: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            batch_result,
            batch_samples: Mutex::new(None),
            streamed_samples: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

impl SessionBackend for ScriptedBackend {
    fn open(&self, _session_id: Uuid, event_tx: mpsc::Sender<SessionEvent>) -> SessionHandle {
        let capacity = if matches!(self.transport, Transport::Stalled(_)) {
            1
        } else {
            64
        };
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<f32>>(capacity);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let transport = self.transport.clone();
        let streamed = Arc::clone(&self.streamed_samples);
        tokio::spawn(async move {
            if let Transport::FailImmediately = transport {
                let _ = event_tx
                    .send(SessionEvent::Failed(SessionError::Transport(
                        "scripted failure".into(),
                    )))
                    .await;
                return;
            }
            if let Transport::Stalled(ref transcripts) = transport {
                // Keep frame_rx alive but never read it; sends past the
                // single buffered slot see a full channel.
                while let Some(control) = control_rx.recv().await {
                    match control {
                        voxstream::session::SessionControl::Finish => {
                            for t in transcripts.clone() {
                                let _ = event_tx.send(SessionEvent::Transcript(t)).await;
                            }
                            let _ = event_tx.send(SessionEvent::Closed).await;
                            return;
                        }
                        voxstream::session::SessionControl::Cancel => return,
                    }
                }
                return;
            }
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        if let Some(samples) = frame {
                            streamed.lock().unwrap().extend_from_slice(&samples);
                        }
                    }
                    control = control_rx.recv() => {
                        match control {
                            Some(voxstream::session::SessionControl::Finish) => {
                                // Drain frames still queued ahead of the
                                // finish request
                                while let Ok(samples) = frame_rx.try_recv() {
                                    streamed.lock().unwrap().extend_from_slice(&samples);
                                }
                                match transport {
                                    Transport::Healthy(ref transcripts) => {
                                        for t in transcripts.clone() {
                                            let _ = event_tx.send(SessionEvent::Transcript(t)).await;
                                        }
                                        let _ = event_tx.send(SessionEvent::Closed).await;
                                    }
                                    Transport::FailOnFinish => {
                                        let _ = event_tx
                                            .send(SessionEvent::Failed(SessionError::Transport(
                                                "scripted finish failure".into(),
                                            )))
                                            .await;
                                    }
                                    Transport::FailImmediately | Transport::Stalled(_) => {
                                        unreachable!()
                                    }
                                }
                                return;
                            }
                            Some(voxstream::session::SessionControl::Cancel) | None => return,
                        }
                    }
                }
            }
        });
        SessionHandle {
            frame_tx,
            control_tx,
        }
    }

    fn batch_transcribe(&self, samples: &[f32], _sample_rate: u32) -> Result<String, SessionError> {
        *self.batch_samples.lock().unwrap() = Some(samples.to_vec());
        match &self.batch_result {
            Some(text) => Ok(text.clone()),
            None => Err(SessionError::NoFallback),
        }
    }

    fn has_fallback(&self) -> bool {
        self.batch_result.is_some()
    }
}

/// Refiner that uppercases the transcript and records the context tag
struct UppercaseRefiner {
    contexts: Arc<Mutex<Vec<ContextTag>>>,
}

#[async_trait::async_trait]
impl RefinePipeline for UppercaseRefiner {
    async fn refine(&self, text: &str, context: ContextTag) -> String {
        self.contexts.lock().unwrap().push(context);
        text.to_uppercase()
    }
}

/// UI sink that records every update
struct RecordingSink(Arc<Mutex<Vec<UiUpdate>>>);

impl UiSink for RecordingSink {
    fn deliver(&mut self, update: &UiUpdate) {
        self.0.lock().unwrap().push(update.clone());
    }
}

// ---------------------------------------------------------------------
// Harness

struct Harness {
    tx: mpsc::Sender<EngineEvent>,
    shutdown: watch::Sender<bool>,
    updates: Arc<Mutex<Vec<UiUpdate>>>,
    engine_task: tokio::task::JoinHandle<()>,
    dispatcher: UiDispatcher,
}

impl Harness {
    /// Build an engine whose capture factory pops one event script per
    /// session start
    fn new(
        capture_scripts: Vec<Vec<CaptureEvent>>,
        backend: Arc<ScriptedBackend>,
        config: Config,
    ) -> Self {
        Self::with_refiner(capture_scripts, backend, config, Arc::new(NoRefine))
    }

    fn with_refiner(
        capture_scripts: Vec<Vec<CaptureEvent>>,
        backend: Arc<ScriptedBackend>,
        config: Config,
        refine: Arc<dyn RefinePipeline>,
    ) -> Self {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = UiDispatcher::spawn(vec![Box::new(RecordingSink(updates.clone()))]);

        let scripts = Arc::new(Mutex::new(VecDeque::from(capture_scripts)));
        let deps = EngineDeps {
            capture_factory: Box::new(move |_config| {
                let events = scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("capture factory called more times than scripted");
                Ok(Box::new(ScriptedCapture {
                    events,
                    keepalive: None,
                }))
            }),
            backend,
            ui: dispatcher.handle(),
            refine,
        };

        let (engine, tx, rx) = Engine::new(config, deps);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine_task = tokio::spawn(engine.run(rx, shutdown_rx));
        Self {
            tx,
            shutdown,
            updates,
            engine_task,
            dispatcher,
        }
    }

    async fn press(&self, mode: BindingMode) {
        self.tx
            .send(EngineEvent::Hotkey(HotkeyEvent {
                mode,
                action: KeyAction::Pressed,
            }))
            .await
            .unwrap();
    }

    async fn release(&self, mode: BindingMode) {
        self.tx
            .send(EngineEvent::Hotkey(HotkeyEvent {
                mode,
                action: KeyAction::Released,
            }))
            .await
            .unwrap();
    }

    /// Wait until the recorded updates satisfy the predicate
    async fn wait_for(&self, what: &str, predicate: impl Fn(&[UiUpdate]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if predicate(&self.updates.lock().unwrap()) {
                return;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {}; saw states {:?}",
                    what,
                    self.states()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn states(&self) -> Vec<DictationState> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| matches!(u.payload, UiPayload::None))
            .map(|u| u.state)
            .collect()
    }

    fn final_text(&self) -> Option<String> {
        self.updates.lock().unwrap().iter().find_map(|u| {
            if let UiPayload::Final(text) = &u.payload {
                Some(text.clone())
            } else {
                None
            }
        })
    }

    fn error_text(&self) -> Option<String> {
        self.updates.lock().unwrap().iter().find_map(|u| {
            if let UiPayload::Error(text) = &u.payload {
                Some(text.clone())
            } else {
                None
            }
        })
    }

    async fn finish(self) {
        self.shutdown.send(true).unwrap();
        let _ = self.engine_task.await;
        self.dispatcher.shutdown().await;
    }
}

fn frame(seq: u64, samples: Vec<f32>) -> CaptureEvent {
    CaptureEvent::Frame(AudioFrame {
        seq,
        samples,
        captured_at: Instant::now(),
    })
}

/// Sentinel level appended after the frames; once the engine surfaces
/// it, every preceding frame has been processed (the forwarder
/// preserves order)
const FRAMES_DONE_LEVEL: f32 = 0.99;

fn speech_script() -> Vec<CaptureEvent> {
    vec![
        CaptureEvent::Level(0.1),
        CaptureEvent::SpeechStarted,
        frame(0, vec![0.1, 0.2]),
        frame(1, vec![0.3, 0.4]),
        frame(2, vec![0.5]),
        CaptureEvent::Level(FRAMES_DONE_LEVEL),
    ]
}

fn frames_processed(updates: &[UiUpdate]) -> bool {
    updates
        .iter()
        .any(|u| matches!(u.payload, UiPayload::Level(l) if (l - FRAMES_DONE_LEVEL).abs() < 1e-6))
}

fn final_transcript(text: &str) -> TranscriptEvent {
    TranscriptEvent {
        kind: TranscriptKind::Final,
        text: text.to_string(),
        confidence: Some(0.9),
        from_finalize: true,
    }
}

fn has_final(updates: &[UiUpdate]) -> bool {
    updates.iter().any(|u| matches!(u.payload, UiPayload::Final(_)))
}

fn has_error(updates: &[UiUpdate]) -> bool {
    updates.iter().any(|u| matches!(u.payload, UiPayload::Error(_)))
}

fn reached_idle_after(updates: &[UiUpdate], state: DictationState) -> bool {
    let position = updates
        .iter()
        .position(|u| u.state == state && matches!(u.payload, UiPayload::None));
    match position {
        Some(i) => updates[i..].iter().any(|u| u.state == DictationState::Idle),
        None => false,
    }
}

// ---------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn hold_session_delivers_final_text() {
    let backend = ScriptedBackend::new(
        Transport::Healthy(vec![final_transcript("hello world")]),
        None,
    );
    let harness = Harness::new(vec![speech_script()], backend.clone(), Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("final text", has_final).await;

    assert_eq!(harness.final_text().as_deref(), Some("hello world"));
    let states = harness.states();
    // Refining is skipped because no refine command is configured
    for expected in [
        DictationState::Listening,
        DictationState::Recording,
        DictationState::Transcribing,
        DictationState::Done,
        DictationState::Idle,
    ] {
        assert!(
            states.contains(&expected),
            "missing state {:?} in {:?}",
            expected,
            states
        );
    }
    assert!(!states.contains(&DictationState::Refining));
    // All captured audio reached the streaming transport in order
    assert_eq!(
        *backend.streamed_samples.lock().unwrap(),
        vec![0.1, 0.2, 0.3, 0.4, 0.5]
    );
    harness.finish().await;
}

#[tokio::test]
async fn release_before_speech_discards_session() {
    let backend = ScriptedBackend::new(Transport::Healthy(vec![]), Some("unused".into()));
    // Levels only; VAD never triggers
    let script = vec![CaptureEvent::Level(0.05), CaptureEvent::Level(0.04)];
    let harness = Harness::new(vec![script], backend.clone(), Config::default());

    harness.press(BindingMode::Hold).await;
    harness
        .wait_for("listening", |u| {
            u.iter().any(|x| x.state == DictationState::Listening)
        })
        .await;
    harness.release(BindingMode::Hold).await;
    harness
        .wait_for("return to idle", |u| {
            reached_idle_after(u, DictationState::Listening)
        })
        .await;

    assert!(harness.final_text().is_none());
    assert!(harness.error_text().is_none());
    assert!(backend.batch_samples.lock().unwrap().is_none());
    assert!(!harness.states().contains(&DictationState::Transcribing));
    harness.finish().await;
}

#[tokio::test]
async fn hold_release_does_not_stop_toggle_session() {
    let backend = ScriptedBackend::new(
        Transport::Healthy(vec![final_transcript("toggled")]),
        None,
    );
    let harness = Harness::new(vec![speech_script()], backend, Config::default());

    harness.press(BindingMode::Toggle).await;
    harness
        .wait_for("recording", |u| {
            u.iter().any(|x| x.state == DictationState::Recording)
        })
        .await;

    // A hold release while a toggle session runs must be ignored
    harness.release(BindingMode::Hold).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!harness.states().contains(&DictationState::Transcribing));

    // The second toggle press stops it
    harness.press(BindingMode::Toggle).await;
    harness.wait_for("final text", has_final).await;
    assert_eq!(harness.final_text().as_deref(), Some("toggled"));
    harness.finish().await;
}

#[tokio::test]
async fn mid_stream_failure_falls_back_with_byte_identical_audio() {
    let backend = ScriptedBackend::new(Transport::FailImmediately, Some("fallback text".into()));
    let harness = Harness::new(vec![speech_script()], backend.clone(), Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("final text", has_final).await;

    assert_eq!(harness.final_text().as_deref(), Some("fallback text"));
    // The fallback received exactly the frames the capture produced,
    // in order, with nothing dropped or resampled
    assert_eq!(
        backend.batch_samples.lock().unwrap().as_deref(),
        Some(&[0.1, 0.2, 0.3, 0.4, 0.5][..])
    );
    harness.finish().await;
}

#[tokio::test]
async fn stalled_transport_falls_back_instead_of_delivering_partial_text() {
    // Frame channel capacity 1 and never drained: only the first frame
    // can be handed over, the rest count as lost
    let backend = ScriptedBackend::new(
        Transport::Stalled(vec![final_transcript("incomplete")]),
        Some("complete text".into()),
    );
    let harness = Harness::new(vec![speech_script()], backend.clone(), Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("final text", has_final).await;

    // The incomplete streaming transcript is discarded; the retained
    // recording goes to the batch fallback in full
    assert_eq!(harness.final_text().as_deref(), Some("complete text"));
    assert_eq!(
        backend.batch_samples.lock().unwrap().as_deref(),
        Some(&[0.1, 0.2, 0.3, 0.4, 0.5][..])
    );
    harness.finish().await;
}

#[tokio::test]
async fn empty_transcript_passes_through_done() {
    // Healthy transport that closes without producing any transcript
    let backend = ScriptedBackend::new(Transport::Healthy(vec![]), None);
    let harness = Harness::new(vec![speech_script()], backend, Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness
        .wait_for("return to idle", |u| {
            reached_idle_after(u, DictationState::Done)
        })
        .await;

    assert!(harness.final_text().is_none());
    assert!(harness.error_text().is_none());
    let states = harness.states();
    let transcribing = states
        .iter()
        .position(|s| *s == DictationState::Transcribing)
        .unwrap();
    assert_eq!(states.get(transcribing + 1), Some(&DictationState::Done));
    harness.finish().await;
}

#[tokio::test]
async fn finish_failure_falls_back() {
    let backend = ScriptedBackend::new(Transport::FailOnFinish, Some("recovered".into()));
    let harness = Harness::new(vec![speech_script()], backend.clone(), Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("final text", has_final).await;

    assert_eq!(harness.final_text().as_deref(), Some("recovered"));
    assert!(backend.batch_samples.lock().unwrap().is_some());
    harness.finish().await;
}

#[tokio::test]
async fn failure_without_fallback_surfaces_error() {
    let backend = ScriptedBackend::new(Transport::FailImmediately, None);
    let harness = Harness::new(vec![speech_script()], backend, Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("error", has_error).await;

    assert!(harness.final_text().is_none());
    assert!(harness
        .error_text()
        .unwrap()
        .to_lowercase()
        .contains("fallback"));
    // Error always returns to Idle so the next dictation can start
    harness
        .wait_for("return to idle", |u| {
            reached_idle_after(u, DictationState::Error)
        })
        .await;
    harness.finish().await;
}

#[tokio::test]
async fn external_signals_drive_a_session() {
    let backend = ScriptedBackend::new(
        Transport::Healthy(vec![final_transcript("signal driven")]),
        None,
    );
    let harness = Harness::new(vec![speech_script()], backend, Config::default());

    harness.tx.send(EngineEvent::StartRequested).await.unwrap();
    harness.wait_for("frames processed", frames_processed).await;
    harness.tx.send(EngineEvent::StopRequested).await.unwrap();
    harness.wait_for("final text", has_final).await;

    assert_eq!(harness.final_text().as_deref(), Some("signal driven"));
    harness.finish().await;
}

#[tokio::test]
async fn stop_without_active_session_is_a_no_op() {
    let backend = ScriptedBackend::new(Transport::Healthy(vec![]), None);
    let harness = Harness::new(vec![], backend, Config::default());

    harness.tx.send(EngineEvent::StopRequested).await.unwrap();
    harness.release(BindingMode::Hold).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.updates.lock().unwrap().is_empty());
    harness.finish().await;
}

#[tokio::test]
async fn max_duration_stops_the_recording() {
    let backend = ScriptedBackend::new(
        Transport::Healthy(vec![final_transcript("cut short")]),
        None,
    );
    let mut config = Config::default();
    config.audio.max_duration_secs = 1;
    let harness = Harness::new(vec![speech_script()], backend, config);

    harness.press(BindingMode::Hold).await;
    harness
        .wait_for("recording", |u| {
            u.iter().any(|x| x.state == DictationState::Recording)
        })
        .await;
    // Never release; the duration cap has to end the session
    harness.wait_for("final text", has_final).await;
    assert_eq!(harness.final_text().as_deref(), Some("cut short"));
    harness.finish().await;
}

#[tokio::test]
async fn interim_transcripts_are_surfaced_before_final() {
    let interim = TranscriptEvent {
        kind: TranscriptKind::Interim,
        text: "hel".to_string(),
        confidence: None,
        from_finalize: false,
    };
    let backend = ScriptedBackend::new(
        Transport::Healthy(vec![interim, final_transcript("hello")]),
        None,
    );
    let harness = Harness::new(vec![speech_script()], backend, Config::default());

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("final text", has_final).await;

    let updates = harness.updates.lock().unwrap().clone();
    let interim_pos = updates
        .iter()
        .position(|u| matches!(&u.payload, UiPayload::Interim(t) if t == "hel"));
    let final_pos = updates
        .iter()
        .position(|u| matches!(&u.payload, UiPayload::Final(t) if t == "hello"));
    assert!(interim_pos.is_some(), "interim never surfaced");
    assert!(interim_pos < final_pos, "interim must precede the final text");
    drop(updates);
    harness.finish().await;
}

#[tokio::test]
async fn refiner_rewrites_the_transcript() {
    let backend = ScriptedBackend::new(
        Transport::Healthy(vec![final_transcript("hello world")]),
        None,
    );
    let contexts = Arc::new(Mutex::new(Vec::new()));
    let harness = Harness::with_refiner(
        vec![speech_script()],
        backend,
        Config::default(),
        Arc::new(UppercaseRefiner {
            contexts: contexts.clone(),
        }),
    );

    harness.press(BindingMode::Hold).await;
    harness.wait_for("frames processed", frames_processed).await;
    harness.release(BindingMode::Hold).await;
    harness.wait_for("final text", has_final).await;

    assert_eq!(harness.final_text().as_deref(), Some("HELLO WORLD"));
    assert!(harness.states().contains(&DictationState::Refining));
    assert_eq!(*contexts.lock().unwrap(), vec![ContextTag::Prose]);
    harness.finish().await;
}
