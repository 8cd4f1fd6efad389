//! Voxstream - hotkey-driven streaming dictation daemon
//!
//! Run `voxstream daemon` to start the daemon (default command).
//! Use `voxstream stop` to stop a running instance, and
//! `voxstream status` (optionally `--follow`) for status bar integration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxstream::config::{self, Config};
use voxstream::daemon;

#[derive(Parser)]
#[command(name = "voxstream")]
#[command(author, version, about = "Hotkey-driven streaming dictation for Wayland")]
#[command(long_about = "
Voxstream is a streaming dictation daemon for Wayland Linux systems.
Hold a hotkey (or tap a toggle key) to dictate; audio streams to a
transcription backend while you speak, so the text is ready almost as
soon as you stop.

SETUP:
  1. Add yourself to the input group: sudo usermod -aG input $USER
  2. Log out and back in
  3. Point [streaming].endpoint at your transcription server
  4. Run: voxstream (to start the daemon)

Compositor keybindings can also drive it: SIGUSR1 starts a dictation,
SIGUSR2 stops it.
")]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Daemon {
        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Stop a running daemon
    Stop,

    /// Show daemon status (for Waybar/polybar integration)
    Status {
        /// Continuously output status changes (for Waybar exec)
        #[arg(long)]
        follow: bool,

        /// Output format: "text" (default) or "json" (for Waybar)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voxstream={},warn", log_level))),
        )
        .with_target(false)
        .init();

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Daemon { foreground: false }) {
        Commands::Daemon { foreground } => {
            // daemon::run forks before starting the runtime, so it must
            // be called from a plain synchronous context
            daemon::run(config, foreground)?;
        }
        Commands::Stop => {
            daemon::stop()?;
        }
        Commands::Status { follow, format } => {
            run_status(&config, follow, &format)?;
        }
        Commands::Config => {
            show_config(&config)?;
        }
    }

    Ok(())
}

/// Show current daemon state from the state file
fn run_status(config: &Config, follow: bool, format: &str) -> anyhow::Result<()> {
    let Some(state_path) = config.resolve_state_file() else {
        eprintln!("Error: state_file is not configured.");
        eprintln!();
        eprintln!("To enable status monitoring, add to your config.toml:");
        eprintln!();
        eprintln!("  state_file = \"auto\"");
        eprintln!();
        eprintln!("This lets external integrations like Waybar monitor voxstream state.");
        std::process::exit(1);
    };

    let print_state = |state: &str| {
        if format == "json" {
            println!("{}", format_state_json(state));
        } else {
            println!("{}", state);
        }
    };

    let state = std::fs::read_to_string(&state_path).unwrap_or_else(|_| "stopped".to_string());
    print_state(state.trim());
    if !follow {
        return Ok(());
    }

    // Follow mode: watch the state file with inotify
    use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc::channel;

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // Watch the parent directory; the file may not exist yet
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    let mut last_state = state.trim().to_string();
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(_event)) => {
                if let Ok(new_state) = std::fs::read_to_string(&state_path) {
                    let new_state = new_state.trim().to_string();
                    if new_state != last_state {
                        print_state(&new_state);
                        last_state = new_state;
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("watch error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // State file gone means the daemon stopped
                if !state_path.exists() && last_state != "stopped" {
                    print_state("stopped");
                    last_state = "stopped".to_string();
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

/// Format state as JSON for Waybar consumption
fn format_state_json(state: &str) -> String {
    let (text, class, tooltip) = match state {
        "idle" => ("", "idle", "Voxstream ready"),
        "listening" => ("…", "listening", "Waiting for speech"),
        "recording" => ("", "recording", "Recording"),
        "transcribing" => ("", "transcribing", "Transcribing"),
        "refining" => ("", "refining", "Refining"),
        "done" => ("", "done", "Done"),
        "error" => ("", "error", "Dictation failed"),
        _ => ("", "stopped", "Voxstream is not running"),
    };
    format!(
        r#"{{"text": "{}", "class": "{}", "tooltip": "{}"}}"#,
        text, class, tooltip
    )
}

/// Print the effective configuration as TOML
fn show_config(config: &Config) -> anyhow::Result<()> {
    match Config::default_path() {
        Some(path) if path.exists() => println!("# Config file: {}\n", path.display()),
        Some(path) => println!("# Config file not found (defaults in effect): {}\n", path.display()),
        None => println!("# Could not determine the config directory\n"),
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
