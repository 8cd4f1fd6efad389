//! UI feedback sinks
//!
//! The orchestrator never blocks on user-facing feedback. Every update
//! goes through a [`UiDispatcher`], which forwards it to a dedicated
//! delivery task over a channel. The task calls each registered
//! [`UiSink`] in turn, so a slow sink delays other sinks but never the
//! dictation pipeline.
//!
//! Sinks included here: desktop notifications via notify-send, a state
//! file for status bars such as Waybar, and a tracing-based log sink.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::state::DictationState;

/// One UI update. State changes always carry the new state; the payload
/// adds whatever detail that state has to show.
#[derive(Debug, Clone)]
pub struct UiUpdate {
    pub state: DictationState,
    pub payload: UiPayload,
}

#[derive(Debug, Clone)]
pub enum UiPayload {
    /// State change with nothing extra to display
    None,
    /// Input level in [0.0, 1.0] while recording
    Level(f32),
    /// Latest interim transcript
    Interim(String),
    /// The finished dictation text
    Final(String),
    /// Human-readable error description
    Error(String),
}

impl UiUpdate {
    pub fn state(state: DictationState) -> Self {
        Self {
            state,
            payload: UiPayload::None,
        }
    }
}

/// A consumer of UI updates. Implementations must not block for long;
/// they all share one delivery task.
pub trait UiSink: Send {
    fn deliver(&mut self, update: &UiUpdate);
    /// Called once when the daemon shuts down
    fn shutdown(&mut self) {}
}

/// Handle used by the orchestrator to publish updates
#[derive(Clone)]
pub struct UiHandle {
    tx: mpsc::UnboundedSender<UiUpdate>,
}

impl UiHandle {
    pub fn publish(&self, update: UiUpdate) {
        // The delivery task only exits at shutdown; a send failure then
        // is harmless.
        let _ = self.tx.send(update);
    }

    pub fn state_changed(&self, state: DictationState) {
        self.publish(UiUpdate::state(state));
    }
}

/// Owns the delivery task. Shutdown stops the task through an explicit
/// signal, so a [`UiHandle`] clone still held somewhere cannot keep the
/// task alive.
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<UiUpdate>,
    close_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl UiDispatcher {
    pub fn spawn(mut sinks: Vec<Box<dyn UiSink>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<UiUpdate>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = rx.recv() => match update {
                        Some(update) => {
                            for sink in sinks.iter_mut() {
                                sink.deliver(&update);
                            }
                        }
                        None => break,
                    },
                    _ = &mut close_rx => {
                        // Flush whatever was queued before the signal
                        while let Ok(update) = rx.try_recv() {
                            for sink in sinks.iter_mut() {
                                sink.deliver(&update);
                            }
                        }
                        break;
                    }
                }
            }
            for sink in sinks.iter_mut() {
                sink.shutdown();
            }
        });
        Self { tx, close_tx, task }
    }

    pub fn handle(&self) -> UiHandle {
        UiHandle {
            tx: self.tx.clone(),
        }
    }

    /// Deliver remaining updates, run sink shutdown hooks, and end the
    /// delivery task
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.close_tx.send(());
        let _ = self.task.await;
    }
}

/// Desktop notifications via notify-send. Level updates are skipped;
/// firing a notification 20 times a second would be noise.
pub struct NotifySink;

impl UiSink for NotifySink {
    fn deliver(&mut self, update: &UiUpdate) {
        let (title, body) = match &update.payload {
            UiPayload::None => match update.state {
                DictationState::Recording => ("Voxstream", "Recording...".to_string()),
                DictationState::Transcribing => ("Voxstream", "Transcribing...".to_string()),
                _ => return,
            },
            UiPayload::Final(text) => ("Voxstream", truncate(text, 120)),
            UiPayload::Error(message) => ("Voxstream error", truncate(message, 200)),
            UiPayload::Level(_) | UiPayload::Interim(_) => return,
        };
        let title = title.to_string();
        tokio::spawn(async move {
            let _ = tokio::process::Command::new("notify-send")
                .args(["--app-name=Voxstream", "--expire-time=2000", &title, &body])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        });
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Writes the current state name to a file for external integrations
/// (e.g., Waybar). The file holds just the state name so consumers can
/// use it directly as a CSS class.
pub struct StateFileSink {
    path: PathBuf,
    last_state: Option<DictationState>,
}

impl StateFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_state: None,
        }
    }

    fn write(&self, state_name: &str) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create state file directory: {}", e);
                return;
            }
        }
        if let Err(e) = std::fs::write(&self.path, state_name) {
            warn!("Failed to write state file: {}", e);
        }
    }
}

impl UiSink for StateFileSink {
    fn deliver(&mut self, update: &UiUpdate) {
        // Only state transitions touch the file; levels and interim
        // text would thrash it.
        if self.last_state == Some(update.state) {
            return;
        }
        self.last_state = Some(update.state);
        self.write(update.state.name());
    }

    fn shutdown(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove state file: {}", e);
            }
        }
    }
}

/// Logs every update through tracing. Always registered; doubles as the
/// headless fallback when no other sink is configured.
pub struct LogSink;

impl UiSink for LogSink {
    fn deliver(&mut self, update: &UiUpdate) {
        match &update.payload {
            UiPayload::None => info!(state = update.state.name(), "state changed"),
            UiPayload::Level(level) => {
                debug!(state = update.state.name(), level = %format!("{:.2}", level), "input level")
            }
            UiPayload::Interim(text) => debug!(state = update.state.name(), %text, "interim"),
            UiPayload::Final(text) => info!(state = update.state.name(), %text, "final transcript"),
            UiPayload::Error(message) => warn!(state = update.state.name(), %message, "error"),
        }
    }
}
