//! Hotkey detection module
//!
//! On Linux, provides kernel-level key event detection using evdev, which
//! works on all Wayland compositors because it operates at the input
//! subsystem level. Requires the user to be in the 'input' group.
//!
//! Several bindings (e.g. one hold key and one toggle key) may be armed
//! at once; all of them route into the same engine channel, with each
//! event tagged by the mode of the binding that produced it.

#[cfg(target_os = "linux")]
pub mod evdev_listener;

use crate::config::{BindingMode, HotkeyConfig};
use crate::error::HotkeyError;
use tokio::sync::mpsc;

/// Physical key action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Pressed,
    Released,
}

/// One event from an armed binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeyEvent {
    /// Mode of the binding that fired
    pub mode: BindingMode,
    pub action: KeyAction,
}

/// Trait for hotkey detection implementations
#[async_trait::async_trait]
pub trait HotkeyListener: Send + Sync {
    /// Start listening for hotkey events.
    /// Returns a channel receiver carrying events from every armed binding.
    async fn start(&mut self) -> Result<mpsc::Receiver<HotkeyEvent>, HotkeyError>;

    /// Stop listening and clean up
    async fn stop(&mut self) -> Result<(), HotkeyError>;
}

/// Factory function to create the appropriate hotkey listener
#[cfg(target_os = "linux")]
pub fn create_listener(config: &HotkeyConfig) -> Result<Box<dyn HotkeyListener>, HotkeyError> {
    Ok(Box::new(evdev_listener::EvdevListener::new(config)?))
}

/// Factory function to create the appropriate hotkey listener
///
/// Built-in hotkey detection is only supported on Linux; elsewhere, drive
/// recording via SIGUSR1/SIGUSR2.
#[cfg(not(target_os = "linux"))]
pub fn create_listener(_config: &HotkeyConfig) -> Result<Box<dyn HotkeyListener>, HotkeyError> {
    Err(HotkeyError::NoKeyboard)
}
