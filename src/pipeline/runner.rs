//! Subprocess runner for the external conversion tool.
//!
//! [`ToolRunner`] is the seam between the queue and the operating system.
//! Production uses [`CommandRunner`]; tests plug in fakes that count or
//! delay invocations without spawning anything.

use crate::config::ConversionCommand;
use crate::error::ThumbError;
use crate::transform::TransformSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::time::Instant;
use tracing::warn;

/// One fully assembled tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    /// `prefix args + pre-size hint + source + transform args + destination`.
    pub args: Vec<String>,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl ToolInvocation {
    pub fn new(
        command: &ConversionCommand,
        transform: &TransformSpec,
        source: &Path,
        destination: &Path,
    ) -> Self {
        let mut args = command.prefix_args.clone();
        args.extend(transform.input_arguments());
        args.push(source.to_string_lossy().into_owned());
        args.extend(transform.arguments());
        args.push(destination.to_string_lossy().into_owned());

        Self {
            program: command.program.clone(),
            args,
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        }
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs a conversion to completion or failure.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `invocation`, giving up after `timeout`.
    ///
    /// # Errors
    /// [`ThumbError::ConversionFailed`] on spawn failure, non-zero exit, or
    /// timeout.
    async fn run(&self, invocation: &ToolInvocation, timeout: Duration) -> Result<(), ThumbError>;
}

/// Spawns the tool as a child process.
///
/// On timeout the child is killed and reaped before `run` returns, so the
/// worker slot is never handed to the next task while the old process still
/// exists. Stderr is drained concurrently with the wait and only kept for
/// failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

#[async_trait]
impl ToolRunner for CommandRunner {
    async fn run(&self, invocation: &ToolInvocation, timeout: Duration) -> Result<(), ThumbError> {
        let program = &invocation.program;
        let failed = |reason: String, stderr: String| ThumbError::ConversionFailed { reason, stderr };
        let deadline = Instant::now() + timeout;

        let mut child = Command::new(program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("cannot spawn '{program}': {e}"), String::new()))?;

        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let waited = tokio::time::timeout_at(deadline, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stderr.abort();
                return Err(failed(format!("waiting for '{program}': {e}"), String::new()));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill '{}': {}", program, e);
                }
                stderr.abort();
                return Err(failed(
                    format!("'{program}' killed after {}ms", timeout.as_millis()),
                    String::new(),
                ));
            }
        };

        if status.success() {
            stderr.abort();
            return Ok(());
        }

        // A grandchild may still hold the pipe open; don't wait past the deadline.
        let stderr = tokio::time::timeout_at(deadline, stderr)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        Err(failed(format!("'{program}' exited with {status}"), stderr))
    }
}

async fn read_pipe(pipe: Option<ChildStderr>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        // Partial output is still worth logging.
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
