//! External command invocation.
//!
//! Runs the configured program once per message:
//! - no arguments, payload written to stdin, stdin closed
//! - stdout discarded, stderr captured for failure logs (capped at 4 KB)
//! - uses `tokio::process::Command` directly (no shell interpretation)

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum stderr kept for logging (4 KB).
const MAX_STDERR_BYTES: usize = 4 * 1024;

/// Errors from a single command invocation.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write payload to stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed waiting for command: {0}")]
    Wait(#[source] std::io::Error),
    #[error("command exited with {status}: {stderr}")]
    ExitStatus { status: ExitStatus, stderr: String },
}

/// Executes one payload. Implementations must finish (or fail) before
/// returning so the dispatcher can keep invocations strictly sequential.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, payload: &[u8]) -> Result<(), CommandError>;
}

/// Runs a program from the filesystem or `PATH`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, payload: &[u8]) -> Result<(), CommandError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // Stdin is fed while stderr drains so neither pipe can fill up and
        // stall the child. Dropping stdin closes it so the command sees EOF.
        let stdin = child.stdin.take();
        let write = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(payload).await,
                None => Ok(()),
            }
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(CommandError::Wait)?;

        // A command that exits early breaks the pipe; its status says more.
        if !output.status.success() {
            return Err(CommandError::ExitStatus {
                status: output.status,
                stderr: truncate_stderr(&output.stderr),
            });
        }
        written.map_err(CommandError::Write)
    }
}

fn truncate_stderr(stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stderr).trim_end().to_string();
    if text.len() > MAX_STDERR_BYTES {
        let mut cut = MAX_STDERR_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("... [stderr truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cat_consumes_payload() {
        let runner = ProcessRunner::new("cat");
        runner.run(b"{\"action\":\"reboot\"}").await.unwrap();
    }

    #[tokio::test]
    async fn empty_payload_succeeds() {
        let runner = ProcessRunner::new("cat");
        runner.run(b"").await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let runner = ProcessRunner::new("false");
        let err = runner.run(b"").await.unwrap_err();
        match err {
            CommandError::ExitStatus { status, .. } => assert_eq!(status.code(), Some(1)),
            other => panic!("expected ExitStatus, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = ProcessRunner::new("/nonexistent/ix-handler");
        let err = runner.run(b"payload").await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { ref program, .. } if program.contains("ix-handler")));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("handler.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_flood_before_reading_stdin_completes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(
            dir.path(),
            "head -c 200000 /dev/zero >&2\ncat >/dev/null\n",
        ));

        let payload = vec![b'p'; 200_000];
        let result =
            tokio::time::timeout(std::time::Duration::from_secs(10), runner.run(&payload)).await;
        assert!(result.is_ok(), "command stalled on its pipes");
        result.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_reports_status_not_broken_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(script(dir.path(), "echo refused >&2\nexit 3\n"));

        let payload = vec![b'p'; 1024 * 1024];
        match runner.run(&payload).await.unwrap_err() {
            CommandError::ExitStatus { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "refused");
            }
            other => panic!("expected ExitStatus, got: {other:?}"),
        }
    }

    #[test]
    fn short_stderr_kept_verbatim() {
        assert_eq!(truncate_stderr(b"boom\n"), "boom");
    }

    #[test]
    fn long_stderr_is_capped() {
        let long = "é".repeat(MAX_STDERR_BYTES);
        let text = truncate_stderr(long.as_bytes());
        assert!(text.ends_with("[stderr truncated]"));
        assert!(text.len() <= MAX_STDERR_BYTES + "... [stderr truncated]".len());
    }
}
