//! Daemon lifecycle and top-level wiring
//!
//! Exactly one voxstream instance may run per user. The instance lock
//! is a PID file created with O_CREAT | O_EXCL; a leftover file from a
//! crashed instance is detected by probing the recorded PID (signal 0
//! plus a /proc comm check, so a recycled PID belonging to some other
//! program does not count as a live instance) and cleared before the
//! lock is taken.
//!
//! Background mode detaches with the daemonize crate before the tokio
//! runtime starts; forking after the runtime exists is not safe.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio;
use crate::config::Config;
use crate::engine::{Engine, EngineDeps, EngineEvent};
use crate::error::{DaemonError, Result, VoxstreamError};
use crate::hotkey;
use crate::refine;
use crate::session::TransportBackend;
use crate::ui::{LogSink, NotifySink, StateFileSink, UiDispatcher, UiSink};

/// Process name the liveness probe expects in /proc/<pid>/comm
const PROCESS_NAME: &str = "voxstream";

/// Holds the PID file for the lifetime of the daemon
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Clear any stale lock, then take the lock for this process.
    /// Fails with AlreadyRunning when a live instance holds it.
    pub fn acquire(path: &Path) -> std::result::Result<Self, DaemonError> {
        cleanup_stale_lock(path)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // create_new maps to O_CREAT | O_EXCL, which closes the race
        // between the staleness check and the write
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    let pid = read_pid(path).unwrap_or(0);
                    DaemonError::AlreadyRunning(pid)
                } else {
                    DaemonError::Io(e)
                }
            })?;
        write!(file, "{}", std::process::id())?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove PID file: {}", e);
        }
    }
}

/// Read the PID recorded in a lock file
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Whether the PID belongs to a live voxstream process. Signal 0 tells
/// us the PID exists; the comm check guards against PID recycling.
pub fn instance_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
        Ok(comm) => comm.trim() == PROCESS_NAME,
        // /proc unavailable; the kill probe is the best we have
        Err(_) => true,
    }
}

fn cleanup_stale_lock(path: &Path) -> std::result::Result<(), DaemonError> {
    if !path.exists() {
        return Ok(());
    }
    let Some(pid) = read_pid(path) else {
        warn!("Removing unreadable PID file at {}", path.display());
        std::fs::remove_file(path)?;
        return Ok(());
    };
    if instance_is_alive(pid) {
        // A live holder keeps the lock; acquire will fail on O_EXCL
        return Ok(());
    }
    info!(pid, "Removing stale PID file (process is gone)");
    std::fs::remove_file(path)
        .map_err(|e| DaemonError::StaleInstance(pid, e.to_string()))?;
    Ok(())
}

/// Entry point for the daemon command. Takes the instance lock and
/// detaches (unless foreground), then builds the runtime and runs the
/// event loop until SIGTERM.
pub fn run(config: Config, foreground: bool) -> Result<()> {
    Config::ensure_directories()?;
    let lock = InstanceLock::acquire(&Config::pid_file()).map_err(VoxstreamError::Daemon)?;

    if !foreground {
        if let Err(e) = detach(&config) {
            lock.release();
            return Err(e);
        }
        // The PID changed across the fork; rewrite the lock file.
        if let Err(e) = std::fs::write(Config::pid_file(), std::process::id().to_string()) {
            warn!("Failed to rewrite PID file after detach: {}", e);
        }
    }

    let runtime = tokio::runtime::Runtime::new().map_err(VoxstreamError::Io)?;
    let result = runtime.block_on(run_loop(config));
    lock.release();
    result
}

/// Detach from the launching terminal with stdout/stderr redirected to
/// the data directory
fn detach(_config: &Config) -> Result<()> {
    let log_dir = Config::data_dir();
    std::fs::create_dir_all(&log_dir)?;
    let stdout = File::create(log_dir.join("daemon.out"))
        .map_err(|e| DaemonError::Detach(format!("cannot create stdout file: {}", e)))?;
    let stderr = File::create(log_dir.join("daemon.err"))
        .map_err(|e| DaemonError::Detach(format!("cannot create stderr file: {}", e)))?;

    println!("Starting voxstream in the background (logs: {})", log_dir.display());

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|e| DaemonError::Detach(format!("fork failed: {}", e)))?;

    info!(pid = std::process::id(), "detached from terminal");
    Ok(())
}

async fn run_loop(config: Config) -> Result<()> {
    info!("voxstream daemon starting (pid {})", std::process::id());

    let mut sinks: Vec<Box<dyn UiSink>> = vec![Box::new(LogSink)];
    if let Some(state_path) = config.resolve_state_file() {
        debug!(path = %state_path.display(), "state file enabled");
        sinks.push(Box::new(StateFileSink::new(state_path)));
    }
    sinks.push(Box::new(NotifySink));
    let dispatcher = UiDispatcher::spawn(sinks);

    let backend = Arc::new(TransportBackend::new(
        config.streaming.clone(),
        config.streaming_api_key(),
        &config.fallback,
    ));
    let deps = EngineDeps {
        capture_factory: Box::new(audio::create_capture),
        backend,
        ui: dispatcher.handle(),
        refine: refine::create_pipeline(&config.refine),
    };

    let (engine, engine_tx, engine_rx) = Engine::new(config.clone(), deps);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hotkey_task = if config.hotkey.enabled {
        Some(spawn_hotkey_listener(&config, engine_tx.clone()).await?)
    } else {
        info!("hotkey listening disabled, control via signals only");
        None
    };
    spawn_signal_handlers(engine_tx, shutdown_tx)?;

    engine.run(engine_rx, shutdown_rx).await;

    if let Some(mut listener) = hotkey_task {
        if let Err(e) = listener.stop().await {
            warn!("hotkey listener did not stop cleanly: {}", e);
        }
    }
    dispatcher.shutdown().await;
    info!("voxstream daemon stopped");
    Ok(())
}

async fn spawn_hotkey_listener(
    config: &Config,
    engine_tx: mpsc::Sender<EngineEvent>,
) -> Result<Box<dyn hotkey::HotkeyListener>> {
    let mut listener = hotkey::create_listener(&config.hotkey)?;
    let mut rx = listener.start().await.map_err(VoxstreamError::Hotkey)?;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if engine_tx.send(EngineEvent::Hotkey(event)).await.is_err() {
                break;
            }
        }
    });
    Ok(listener)
}

/// SIGUSR1 starts a dictation, SIGUSR2 stops it (compositor keybinding
/// integration); SIGTERM and Ctrl-C shut the daemon down.
fn spawn_signal_handlers(
    engine_tx: mpsc::Sender<EngineEvent>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let mut sigusr1 = signal(SignalKind::user_defined1())
        .map_err(|e| VoxstreamError::Config(format!("failed to set up SIGUSR1 handler: {}", e)))?;
    let mut sigusr2 = signal(SignalKind::user_defined2())
        .map_err(|e| VoxstreamError::Config(format!("failed to set up SIGUSR2 handler: {}", e)))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| VoxstreamError::Config(format!("failed to set up SIGTERM handler: {}", e)))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigusr1.recv() => {
                    debug!("received SIGUSR1 (start dictation)");
                    let _ = engine_tx.send(EngineEvent::StartRequested).await;
                }
                _ = sigusr2.recv() => {
                    debug!("received SIGUSR2 (stop dictation)");
                    let _ = engine_tx.send(EngineEvent::StopRequested).await;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl-C, shutting down");
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        }
    });
    Ok(())
}

/// Ask a running daemon to shut down
pub fn stop() -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let path = Config::pid_file();
    let Some(pid) = read_pid(&path) else {
        return Err(DaemonError::NotRunning(path.display().to_string()).into());
    };
    if !instance_is_alive(pid) {
        // Clear the leftover file so the next start is clean
        let _ = std::fs::remove_file(&path);
        return Err(DaemonError::NotRunning(path.display().to_string()).into());
    }
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| DaemonError::Shutdown(format!("failed to signal pid {}: {}", pid, e)))?;
    println!("Sent stop request to voxstream (pid {})", pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_foreign_pid_is_not_ours() {
        // PID 1 is always alive but is never a voxstream process
        assert!(!instance_is_alive(1));
    }

    #[test]
    fn test_read_pid_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid(&path), Some(1234));
    }
}
