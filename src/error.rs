//! Error types for voxstream
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues. Every error that can
//! surface as the Error state carries enough context for the UI to
//! display it without log inspection.

use thiserror::Error;

/// Top-level error type for the voxstream application
#[derive(Error, Debug)]
pub enum VoxstreamError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hotkey error: {0}")]
    Hotkey(#[from] HotkeyError),

    #[error("Audio capture error: {0}")]
    Audio(#[from] AudioError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to hotkey detection
#[derive(Error, Debug)]
pub enum HotkeyError {
    #[error("Cannot open input device '{0}'. Is the user in the 'input' group?\n  Run: sudo usermod -aG input $USER\n  Then log out and back in.")]
    DeviceAccess(String),

    #[error("Unknown key name: '{0}'. Use evtest or wev to find valid key names.")]
    UnknownKey(String),

    #[error("No keyboard device found in /dev/input/")]
    NoKeyboard,

    #[error("No hotkey bindings configured. Add a [[hotkey.bindings]] entry to config.toml.")]
    NoBindings,

    #[error("evdev error: {0}")]
    Evdev(String),
}

/// Errors related to audio capture (microphone side)
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio device not found: '{0}'. List devices with: pactl list sources short")]
    DeviceNotFound(String),

    #[error("Audio device '{0}' is busy or unavailable: {1}. Close other recording applications and retry.")]
    DeviceBusy(String, String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Audio frame queue stalled for {0} ms; a frame was not delivered. This indicates a wedged consumer, not a recoverable glitch.")]
    Backpressure(u64),

    #[error("No audio was captured. Check your microphone.")]
    EmptyRecording,

    #[error("Capture thread did not confirm shutdown within {0}s")]
    StopTimeout(u64),
}

/// Errors related to the transcription session (streaming or fallback)
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Failed to connect to transcription backend at {endpoint}: {reason}. Check the endpoint URL and your network.")]
    Connect { endpoint: String, reason: String },

    #[error("Timed out connecting to transcription backend after {0}s. Check the endpoint URL and your network.")]
    ConnectTimeout(u64),

    #[error("Transport failure mid-session: {0}")]
    Transport(String),

    #[error("Backend protocol error: {0}")]
    Protocol(String),

    #[error("Backend reported a fatal error ({code}): {message}")]
    Fatal { code: u16, message: String },

    #[error("Fallback transcription failed: {0}")]
    Fallback(String),

    #[error("No fallback endpoint configured. Set [fallback].endpoint in config.toml to survive streaming outages.")]
    NoFallback,

    #[error("Session configuration error: {0}")]
    Config(String),
}

/// Errors related to the daemon process lifecycle
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("voxstream is already running (pid {0}). Use 'voxstream stop' to stop it.")]
    AlreadyRunning(u32),

    #[error("Stale instance lock found (pid {0} is gone) but it could not be cleared: {1}")]
    StaleInstance(u32, String),

    #[error("Failed to detach from the launching terminal: {0}")]
    Detach(String),

    #[error("Daemon terminated abnormally mid-session: {0}")]
    Shutdown(String),

    #[error("No running daemon found (no PID file at {0})")]
    NotRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using VoxstreamError
pub type Result<T> = std::result::Result<T, VoxstreamError>;

#[cfg(target_os = "linux")]
impl From<evdev::Error> for HotkeyError {
    fn from(e: evdev::Error) -> Self {
        HotkeyError::Evdev(e.to_string())
    }
}
