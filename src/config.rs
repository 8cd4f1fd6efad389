//! Configuration loading and types for voxstream
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/voxstream/config.toml)
//! 3. CLI arguments (highest priority)

use crate::error::VoxstreamError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Voxstream Configuration
#
# Location: ~/.config/voxstream/config.toml
# All settings can be overridden via CLI flags

# State file for external integrations (Waybar, polybar, etc.)
# Use "auto" for default location ($XDG_RUNTIME_DIR/voxstream/state),
# a custom path, or "disabled" to turn off. The daemon writes state
# ("idle", "listening", "recording", "transcribing", "refining") to this
# file whenever it changes. Required for `voxstream status`.
state_file = "auto"

[hotkey]
# Hotkey bindings. Several bindings may be armed at the same time,
# e.g. one hold-to-talk key and one toggle key.
#
# mode = "hold":   record while the key is physically held
# mode = "toggle": one press starts, a second press stops
#
# Use `evtest` to find key names for your keyboard.
[[hotkey.bindings]]
key = "SCROLLLOCK"
mode = "hold"
modifiers = []

# [[hotkey.bindings]]
# key = "F13"
# mode = "toggle"
# modifiers = []

[audio]
# Audio input device ("default" uses system default)
# List devices with: pactl list sources short
device = "default"

# Sample rate in Hz (transcription backends expect 16000)
sample_rate = 16000

# Frame size handed to the streaming session, in milliseconds
frame_ms = 20

# Pre-roll retained before speech onset, in milliseconds. Energy VAD lags
# true onset; this buffer is prepended so the first syllable is not clipped.
preroll_ms = 200

# Maximum recording duration in seconds (safety limit)
max_duration_secs = 120

# How long the capture thread may wait handing a frame off before the
# frame is counted as lost, in milliseconds
send_timeout_ms = 250

# Cadence of normalized level samples for visualization, in milliseconds
level_interval_ms = 50

[audio.vad]
# Speech onset sensitivity (0.0 = very sensitive, 1.0 = requires loud speech)
threshold = 0.5

# Minimum sustained speech before triggering, in milliseconds
min_speech_ms = 60

[streaming]
# WebSocket endpoint of the streaming transcription backend
endpoint = "wss://localhost:8090/v1/stream"

# API key sent in the session start message. May also be provided via
# the VOXSTREAM_API_KEY environment variable.
# api_key = ""

# Model name requested from the backend
model = "streaming-v1"

# Connection establishment timeout in seconds
connect_timeout_secs = 10

# How long to wait for the finalize acknowledgement before the close
# message is sent anyway, in milliseconds. Finalize is best effort.
finalize_timeout_ms = 2000

[fallback]
# OpenAI-compatible batch endpoint used when the streaming transport
# cannot be established or fails mid-session. Leave unset to disable.
# endpoint = "http://localhost:8080"
# model = "whisper-1"

# Request timeout in seconds
timeout_secs = 30

[refine]
# Optional post-processing of the final transcript. The command receives
# the transcript on stdin and the detected context tag in $VOXSTREAM_CONTEXT,
# and must print the refined text on stdout. On any failure the original
# transcript is used.
# command = "ollama run llama3.2:1b 'Clean up this dictation:'"
timeout_ms = 30000
"#;

/// Hotkey binding mode
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// Record while the key is physically held (default)
    #[default]
    Hold,
    /// Press once to start recording, press again to stop
    Toggle,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hotkey: HotkeyConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub refine: RefineConfig,

    /// Optional path to state file for external integrations (e.g., Waybar).
    /// "auto" resolves to $XDG_RUNTIME_DIR/voxstream/state, "disabled" turns
    /// it off.
    #[serde(default = "default_state_file")]
    pub state_file: Option<String>,
}

/// One armed hotkey binding
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BindingConfig {
    /// Key name (evdev KEY_* constant name, without the KEY_ prefix)
    /// Examples: "SCROLLLOCK", "RIGHTALT", "PAUSE", "F24"
    pub key: String,

    /// Optional modifier keys that must also be held
    #[serde(default)]
    pub modifiers: Vec<String>,

    /// Binding mode: hold (record while held) or toggle (press to start/stop)
    #[serde(default)]
    pub mode: BindingMode,
}

/// Hotkey detection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotkeyConfig {
    /// Armed bindings. A hold binding and a toggle binding may coexist;
    /// both route into the same engine.
    #[serde(default = "default_bindings")]
    pub bindings: Vec<BindingConfig>,

    /// Enable built-in hotkey detection (default: true). Set to false when
    /// driving recording via SIGUSR1/SIGUSR2 from compositor keybindings.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Audio capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// PipeWire/PulseAudio device name, or "default"
    #[serde(default = "default_device")]
    pub device: String,

    /// Sample rate in Hz (backends expect 16000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frame size in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// Pre-roll retained before speech onset, in milliseconds
    #[serde(default = "default_preroll_ms")]
    pub preroll_ms: u32,

    /// Maximum recording duration in seconds (safety limit)
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u32,

    /// Bounded hand-off wait before a frame counts as lost, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Cadence of normalized level samples, in milliseconds
    #[serde(default = "default_level_interval_ms")]
    pub level_interval_ms: u32,

    /// Voice activity detection settings
    #[serde(default)]
    pub vad: VadConfig,
}

/// Energy VAD configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VadConfig {
    /// Speech onset sensitivity (0.0 - 1.0)
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    /// Minimum sustained speech before triggering, in milliseconds
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,
}

/// Streaming transcription backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    /// WebSocket endpoint (ws:// or wss://)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key; falls back to the VOXSTREAM_API_KEY environment variable
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name requested from the backend
    #[serde(default = "default_model")]
    pub model: String,

    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bounded wait for the finalize acknowledgement, in milliseconds.
    /// Finalize is best effort; close is sent when this expires.
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,
}

/// Synchronous batch fallback configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    /// OpenAI-compatible endpoint (e.g., "http://localhost:8080").
    /// None disables the fallback path.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Model name to send to the server
    #[serde(default)]
    pub model: Option<String>,

    /// Optional API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_fallback_timeout")]
    pub timeout_secs: u64,
}

/// Transcript refinement configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefineConfig {
    /// Shell command the transcript is piped through. None disables
    /// refinement and Transcribing goes straight to Done.
    #[serde(default)]
    pub command: Option<String>,

    /// Command timeout in milliseconds
    #[serde(default = "default_refine_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_state_file() -> Option<String> {
    Some("auto".to_string())
}

fn default_bindings() -> Vec<BindingConfig> {
    vec![BindingConfig {
        key: "SCROLLLOCK".to_string(),
        modifiers: Vec::new(),
        mode: BindingMode::Hold,
    }]
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_frame_ms() -> u32 {
    20
}

fn default_preroll_ms() -> u32 {
    200
}

fn default_max_duration() -> u32 {
    120
}

fn default_send_timeout_ms() -> u64 {
    250
}

fn default_level_interval_ms() -> u32 {
    50
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_min_speech_ms() -> u32 {
    60
}

fn default_endpoint() -> String {
    "wss://localhost:8090/v1/stream".to_string()
}

fn default_model() -> String {
    "streaming-v1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_finalize_timeout_ms() -> u64 {
    2000
}

fn default_fallback_timeout() -> u64 {
    30
}

fn default_refine_timeout_ms() -> u64 {
    30000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hotkey: HotkeyConfig::default(),
            audio: AudioConfig::default(),
            streaming: StreamingConfig::default(),
            fallback: FallbackConfig::default(),
            refine: RefineConfig::default(),
            state_file: default_state_file(),
        }
    }
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            bindings: default_bindings(),
            enabled: true,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            preroll_ms: default_preroll_ms(),
            max_duration_secs: default_max_duration(),
            send_timeout_ms: default_send_timeout_ms(),
            level_interval_ms: default_level_interval_ms(),
            vad: VadConfig::default(),
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            min_speech_ms: default_min_speech_ms(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            api_key: None,
            timeout_secs: default_fallback_timeout(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            connect_timeout_secs: default_connect_timeout(),
            finalize_timeout_ms: default_finalize_timeout_ms(),
        }
    }
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_ms: default_refine_timeout_ms(),
        }
    }
}

impl Config {
    /// Configuration directory (~/.config/voxstream)
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("voxstream"))
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }

    /// Runtime directory for the PID file and state file
    pub fn runtime_dir() -> PathBuf {
        dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("voxstream")
    }

    /// Data directory for daemon logs
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("voxstream")
    }

    /// PID file path for singleton enforcement
    pub fn pid_file() -> PathBuf {
        Self::runtime_dir().join("pid")
    }

    /// Create required directories
    pub fn ensure_directories() -> std::io::Result<()> {
        if let Some(dir) = Self::config_dir() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(Self::runtime_dir())?;
        std::fs::create_dir_all(Self::data_dir())?;
        Ok(())
    }

    /// Resolve the configured state file path, if enabled
    pub fn resolve_state_file(&self) -> Option<PathBuf> {
        match self.state_file.as_deref() {
            None | Some("disabled") | Some("") => None,
            Some("auto") => Some(Self::runtime_dir().join("state")),
            Some(path) => Some(PathBuf::from(path)),
        }
    }

    /// Resolve the streaming API key from config or environment
    pub fn streaming_api_key(&self) -> Option<String> {
        self.streaming
            .api_key
            .clone()
            .or_else(|| std::env::var("VOXSTREAM_API_KEY").ok())
    }
}

/// Load configuration from the given path, the default location, or
/// built-in defaults when no file exists.
pub fn load_config(path: Option<&Path>) -> Result<Config, VoxstreamError> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => Config::default_path().filter(|p| p.exists()),
    };

    let config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                VoxstreamError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let config: Config = toml::from_str(&contents).map_err(|e| {
                VoxstreamError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            tracing::debug!("Loaded config from {}", path.display());
            config
        }
        None => {
            tracing::debug!("No config file found, using defaults");
            Config::default()
        }
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), VoxstreamError> {
    if config.audio.sample_rate == 0 {
        return Err(VoxstreamError::Config(
            "audio.sample_rate must be non-zero".to_string(),
        ));
    }
    if config.audio.frame_ms == 0 {
        return Err(VoxstreamError::Config(
            "audio.frame_ms must be non-zero".to_string(),
        ));
    }
    if !config.streaming.endpoint.starts_with("ws://")
        && !config.streaming.endpoint.starts_with("wss://")
    {
        return Err(VoxstreamError::Config(format!(
            "streaming.endpoint must start with ws:// or wss://, got: {}",
            config.streaming.endpoint
        )));
    }
    if let Some(ref endpoint) = config.fallback.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(VoxstreamError::Config(format!(
                "fallback.endpoint must start with http:// or https://, got: {}",
                endpoint
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.preroll_ms, 200);
        assert_eq!(config.streaming.finalize_timeout_ms, 2000);
        assert_eq!(config.hotkey.bindings.len(), 1);
        assert_eq!(config.hotkey.bindings[0].mode, BindingMode::Hold);
        validate(&config).unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.audio.frame_ms, 20);
        assert_eq!(config.streaming.connect_timeout_secs, 10);
        assert!(config.fallback.endpoint.is_none());
        assert!(config.refine.command.is_none());
    }

    #[test]
    fn test_multiple_bindings() {
        let config: Config = toml::from_str(
            r#"
            [[hotkey.bindings]]
            key = "SCROLLLOCK"
            mode = "hold"

            [[hotkey.bindings]]
            key = "F13"
            mode = "toggle"
            "#,
        )
        .unwrap();
        assert_eq!(config.hotkey.bindings.len(), 2);
        assert_eq!(config.hotkey.bindings[0].mode, BindingMode::Hold);
        assert_eq!(config.hotkey.bindings[1].mode, BindingMode::Toggle);
    }

    #[test]
    fn test_invalid_streaming_endpoint_rejected() {
        let config: Config = toml::from_str(
            r#"
            [streaming]
            endpoint = "http://not-a-websocket"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_state_file_resolution() {
        let mut config = Config::default();
        assert!(config.resolve_state_file().is_some());

        config.state_file = Some("disabled".to_string());
        assert!(config.resolve_state_file().is_none());

        config.state_file = Some("/tmp/custom-state".to_string());
        assert_eq!(
            config.resolve_state_file(),
            Some(PathBuf::from("/tmp/custom-state"))
        );
    }
}
