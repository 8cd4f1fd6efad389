//! Optional post-transcription refinement
//!
//! After the final transcript is assembled, an external command can
//! rewrite it (punctuation cleanup, an LLM pass, whatever the user
//! configures). The command receives the raw text on stdin and a
//! context tag in the VOXSTREAM_CONTEXT environment variable, and must
//! print the refined text to stdout.
//!
//! Refinement is strictly best-effort: a missing command, non-zero
//! exit, or timeout falls back to the unrefined text. Dictation output
//! must never be lost to a broken refine hook.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::RefineConfig;

/// Context tag passed to the refine command so it can adjust style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTag {
    /// Looks like a shell command; keep it terse, no punctuation
    Terminal,
    /// Ordinary prose
    Prose,
}

impl ContextTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextTag::Terminal => "terminal",
            ContextTag::Prose => "prose",
        }
    }
}

/// Guess the context from the transcript itself. Deliberately crude:
/// a leading well-known command name or option-looking tokens suggest
/// the user is dictating into a terminal.
pub fn detect_context(text: &str) -> ContextTag {
    const COMMANDS: &[&str] = &[
        "cd", "ls", "cat", "grep", "git", "cargo", "make", "ssh", "curl", "rm", "mv", "cp",
        "sudo", "docker", "kubectl", "vim", "python",
    ];
    let trimmed = text.trim();
    let first_word = trimmed.split_whitespace().next().unwrap_or("");
    if COMMANDS.contains(&first_word.to_lowercase().as_str()) {
        return ContextTag::Terminal;
    }
    if trimmed.split_whitespace().any(|w| w.starts_with("--")) {
        return ContextTag::Terminal;
    }
    ContextTag::Prose
}

/// Seam for the refinement step; the orchestrator only sees this trait
#[async_trait::async_trait]
pub trait RefinePipeline: Send + Sync {
    /// Refine the transcript. Implementations return the input text
    /// unchanged when refinement is unavailable or fails.
    async fn refine(&self, text: &str, context: ContextTag) -> String;

    /// Whether this pipeline actually transforms text; the workflow
    /// skips the Refining state when it does not
    fn is_active(&self) -> bool {
        true
    }
}

/// Pass-through pipeline used when no refine command is configured
pub struct NoRefine;

#[async_trait::async_trait]
impl RefinePipeline for NoRefine {
    async fn refine(&self, text: &str, _context: ContextTag) -> String {
        text.to_string()
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Runs a user-configured shell command over the transcript
pub struct CommandRefiner {
    command: String,
    timeout: Duration,
}

impl CommandRefiner {
    /// Build from config; returns None when no command is set
    pub fn from_config(config: &RefineConfig) -> Option<Self> {
        let command = config.command.clone()?;
        Some(Self {
            command,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    async fn run(&self, text: &str, context: ContextTag) -> Option<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("VOXSTREAM_CONTEXT", context.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| warn!("Failed to spawn refine command: {}", e))
            .ok()?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                warn!("Failed to write to refine command stdin: {}", e);
                return None;
            }
            // Drop closes stdin so the command sees EOF
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Refine command failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Refine command timed out"
                );
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                status = %output.status,
                stderr = %stderr.trim(),
                "Refine command exited non-zero"
            );
            return None;
        }

        let refined = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if refined.is_empty() {
            warn!("Refine command produced empty output, keeping original text");
            return None;
        }
        Some(refined)
    }
}

#[async_trait::async_trait]
impl RefinePipeline for CommandRefiner {
    async fn refine(&self, text: &str, context: ContextTag) -> String {
        match self.run(text, context).await {
            Some(refined) => {
                debug!(context = context.as_str(), "transcript refined");
                refined
            }
            None => text.to_string(),
        }
    }
}

/// Build the pipeline the config asks for
pub fn create_pipeline(config: &RefineConfig) -> Arc<dyn RefinePipeline> {
    match CommandRefiner::from_config(config) {
        Some(refiner) => Arc::new(refiner),
        None => Arc::new(NoRefine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refiner(command: &str, timeout_ms: u64) -> CommandRefiner {
        CommandRefiner::from_config(&RefineConfig {
            command: Some(command.to_string()),
            timeout_ms,
        })
        .unwrap()
    }

    #[test]
    fn test_detect_context() {
        assert_eq!(detect_context("git status"), ContextTag::Terminal);
        assert_eq!(detect_context("ls -la /tmp"), ContextTag::Terminal);
        assert_eq!(detect_context("run with --verbose please"), ContextTag::Terminal);
        assert_eq!(detect_context("hello world, how are you"), ContextTag::Prose);
        assert_eq!(detect_context(""), ContextTag::Prose);
    }

    #[tokio::test]
    async fn test_command_refines_via_stdin() {
        let refiner = refiner("tr 'a-z' 'A-Z'", 5000);
        let out = refiner.refine("hello world", ContextTag::Prose).await;
        assert_eq!(out, "HELLO WORLD");
    }

    #[tokio::test]
    async fn test_context_env_is_visible() {
        let refiner = refiner("printf '%s' \"$VOXSTREAM_CONTEXT\"", 5000);
        let out = refiner.refine("git status", ContextTag::Terminal).await;
        assert_eq!(out, "terminal");
    }

    #[tokio::test]
    async fn test_failing_command_falls_back() {
        let refiner = refiner("exit 3", 5000);
        let out = refiner.refine("keep me", ContextTag::Prose).await;
        assert_eq!(out, "keep me");
    }

    #[tokio::test]
    async fn test_missing_command_falls_back() {
        let refiner = refiner("/nonexistent/binary-xyz", 5000);
        let out = refiner.refine("keep me", ContextTag::Prose).await;
        assert_eq!(out, "keep me");
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let refiner = refiner("sleep 5", 100);
        let out = refiner.refine("keep me", ContextTag::Prose).await;
        assert_eq!(out, "keep me");
    }

    #[tokio::test]
    async fn test_empty_output_falls_back() {
        let refiner = refiner("true", 5000);
        let out = refiner.refine("keep me", ContextTag::Prose).await;
        assert_eq!(out, "keep me");
    }

    #[tokio::test]
    async fn test_no_refine_passthrough() {
        let out = NoRefine.refine("as is", ContextTag::Prose).await;
        assert_eq!(out, "as is");
        assert!(!NoRefine.is_active());
        assert!(refiner("cat", 5000).is_active());
    }
}
