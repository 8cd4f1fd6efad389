//! Voxstream - hotkey-driven streaming dictation daemon
//!
//! A single-process daemon that turns a hotkey press into live
//! transcribed text. Audio streams to the transcription backend while
//! the user is still speaking, so the final text arrives almost
//! immediately after the hotkey is released.
//!
//! ```text
//!  evdev hotkeys ─┐
//!  SIGUSR1/2 ─────┼──> engine (state machine actor) ──> ui sinks
//!  cpal capture ──┘         │            │
//!   (VAD + pre-roll)        │            └─> refine command
//!                           v
//!                streaming session (WebSocket)
//!                           │ on failure
//!                           v
//!                batch fallback (HTTP multipart)
//! ```
//!
//! The engine is the only task that mutates dictation state; every
//! other component communicates with it over channels.

pub mod audio;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod hotkey;
pub mod refine;
pub mod session;
pub mod state;
pub mod ui;

pub use config::Config;
pub use error::{Result, VoxstreamError};
pub use state::{DictationSession, DictationState};
