//! Command channel: the operator-facing shell.
//!
//! Reads one line at a time from the operator, sends it to the coordinator
//! as a `command` frame, waits for the single `output` frame that answers
//! it, and prints that. There is never more than one command in flight.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Framed, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::bridge::{Frame, FrameCodec, FrameKind};
use crate::config::DEFAULT_PROMPT;
use crate::error::AgentError;
use crate::lifecycle::{Channel, ChannelResult, StopReason};

const EXIT_COMMAND: &[u8] = b"exit";
const CHANNEL: Channel = Channel::Command;

#[derive(Debug, PartialEq, Eq)]
enum ShellState {
    Connected,
    AwaitingInput,
    Sending(Bytes),
    AwaitingReply,
    Terminated(StopReason),
}

/// Drives the command channel over any coordinator stream and operator console.
pub struct CommandChannel<S, I, O> {
    coordinator: Framed<S, FrameCodec>,
    operator: FramedRead<I, AnyDelimiterCodec>,
    console: O,
    prompt: String,
}

impl<S, I, O> CommandChannel<S, I, O>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(coordinator: S, operator_input: I, console: O) -> Self {
        Self {
            coordinator: Framed::new(coordinator, FrameCodec::expecting(FrameKind::Output)),
            operator: FramedRead::new(operator_input, operator_lines()),
            console,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Run until the operator exits, a fatal error occurs, or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> ChannelResult {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Command channel cancelled");
                Ok(StopReason::Cancelled)
            }
            result = self.drive() => result,
        }
    }

    async fn drive(&mut self) -> ChannelResult {
        let mut state = ShellState::Connected;
        loop {
            state = match state {
                ShellState::Connected => {
                    tracing::debug!("Command channel connected");
                    ShellState::AwaitingInput
                }
                ShellState::AwaitingInput => self.await_input().await?,
                ShellState::Sending(command) => {
                    tracing::debug!(
                        command = %String::from_utf8_lossy(&command),
                        len = command.len(),
                        "Sending command"
                    );
                    self.coordinator
                        .send(Frame::command(command))
                        .await
                        .map_err(|e| AgentError::frame(CHANNEL, e))?;
                    ShellState::AwaitingReply
                }
                ShellState::AwaitingReply => {
                    let frame = self
                        .coordinator
                        .next()
                        .await
                        .ok_or(AgentError::ConnectionClosed { channel: CHANNEL })?
                        .map_err(|e| AgentError::frame(CHANNEL, e))?;
                    tracing::debug!(len = frame.payload().len(), "Received output");
                    self.render(frame.payload()).await?;
                    ShellState::AwaitingInput
                }
                ShellState::Terminated(reason) => {
                    tracing::info!(?reason, "Command channel terminated");
                    return Ok(reason);
                }
            };
        }
    }

    async fn await_input(&mut self) -> Result<ShellState, AgentError> {
        self.console
            .write_all(self.prompt.as_bytes())
            .await
            .map_err(AgentError::Console)?;
        self.console.flush().await.map_err(AgentError::Console)?;

        let line = match self.operator.next().await {
            None => return Ok(ShellState::Terminated(StopReason::OperatorInputClosed)),
            Some(line) => line.map_err(console_error)?,
        };

        let line = strip_carriage_return(line);
        if line.is_empty() {
            Ok(ShellState::AwaitingInput)
        } else if line == EXIT_COMMAND {
            Ok(ShellState::Terminated(StopReason::OperatorExit))
        } else {
            Ok(ShellState::Sending(line))
        }
    }

    /// Output is written verbatim, then a newline.
    async fn render(&mut self, output: &[u8]) -> Result<(), AgentError> {
        self.console
            .write_all(output)
            .await
            .map_err(AgentError::Console)?;
        self.console
            .write_all(b"\n")
            .await
            .map_err(AgentError::Console)?;
        self.console.flush().await.map_err(AgentError::Console)
    }
}

/// Operator lines are raw bytes split on `\n`; no encoding is assumed.
fn operator_lines() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec())
}

fn strip_carriage_return(line: Bytes) -> Bytes {
    if line.ends_with(b"\r") {
        line.slice(..line.len() - 1)
    } else {
        line
    }
}

fn console_error(err: AnyDelimiterCodecError) -> AgentError {
    match err {
        AnyDelimiterCodecError::Io(e) => AgentError::Console(e),
        other => AgentError::Console(std::io::Error::new(std::io::ErrorKind::InvalidData, other)),
    }
}
