//! Subprocess spawning and output capture.
//!
//! [`Spawner`] is the extension point for how a command line becomes a
//! process; [`RunningCommand`] owns the child while input is fed and output
//! drained, and is the one place a run can be cut short.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::ExecError;
use crate::config::DEFAULT_SHELL;

/// What happens to a command's standard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    /// Dropped; only standard output is returned to the coordinator.
    #[default]
    Discard,
    /// Shares the agent's own standard error.
    Inherit,
}

impl StderrMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Discard => Stdio::null(),
            Self::Inherit => Stdio::inherit(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawned process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Extension point for different process launch strategies.
///
/// Implementations must give the child piped stdin and stdout.
pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &OsStr, cwd: &Path) -> Result<Child, SpawnError>;
}

/// Runs command lines through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    shell: PathBuf,
    stderr: StderrMode,
}

impl Default for ShellSpawner {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            stderr: StderrMode::default(),
        }
    }
}

impl ShellSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }
}

impl Spawner for ShellSpawner {
    fn spawn(&self, command: &OsStr, cwd: &Path) -> Result<Child, SpawnError> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .env("PWD", cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr.stdio())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// A spawned command that has not yet produced its output.
///
/// Children from [`ShellSpawner`] are killed when this is dropped.
pub struct RunningCommand {
    child: Child,
}

impl RunningCommand {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Feed `input` to stdin, close it, and collect stdout until it closes.
    ///
    /// Input is written on its own task so a command that starts printing
    /// before it has read all of its input cannot deadlock against us. At
    /// most `limit` bytes of output are accepted. Cancelling `cancel` kills
    /// the child and returns [`ExecError::Cancelled`].
    pub async fn run(
        mut self,
        input: Bytes,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecError> {
        let mut stdin = self
            .child
            .stdin
            .take()
            .ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;

        let input_len = input.len();
        let feeder = tokio::spawn(async move {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // Command exited or closed stdin without reading everything.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(input_len, "Command closed stdin before reading all input");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to write command input"),
            }
            // stdin is dropped here, closing the pipe.
        });

        let output = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                feeder.abort();
                self.kill().await;
                return Err(ExecError::Cancelled);
            }
            output = collect_output(stdout, limit) => output,
        };

        if let Err(e) = &output {
            tracing::debug!(error = %e, "Output collection failed, killing command");
            feeder.abort();
            self.kill().await;
            return output;
        }

        let _ = feeder.await;

        let exited = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            status = self.child.wait() => Some(status),
        };
        match exited {
            Some(status) => {
                let status = status?;
                tracing::debug!(%status, "Command exited");
                output
            }
            None => {
                self.kill().await;
                Err(ExecError::Cancelled)
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill command");
        }
    }
}

/// Read `reader` to end into one growable buffer, failing once it would
/// exceed `limit` bytes.
async fn collect_output<R>(reader: R, limit: usize) -> Result<Bytes, ExecError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    let mut reader = reader.take(limit as u64 + 1);
    while reader.read_buf(&mut buf).await? != 0 {}

    if buf.len() > limit {
        return Err(ExecError::OutputTooLarge { limit });
    }
    Ok(buf.freeze())
}
