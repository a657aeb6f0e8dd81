//! Agent-level errors.
//!
//! Every variant ends the agent: there is no reconnect and no per-request
//! recovery. Recoverable conditions (a failed `cd`) never reach this type.

use std::io;

use crate::bridge::FrameError;
use crate::exec::ExecError;
use crate::lifecycle::Channel;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("couldn't connect to coordinator at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("couldn't bind request listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("coordinator closed the {channel} channel")]
    ConnectionClosed { channel: Channel },

    #[error("{channel} channel protocol error: {source}")]
    Protocol { channel: Channel, source: FrameError },

    #[error("{channel} channel transport error: {source}")]
    Transport { channel: Channel, source: io::Error },

    #[error("operator console error: {0}")]
    Console(io::Error),

    #[error("command execution failed: {0}")]
    Exec(#[from] ExecError),

    /// `channel` is `None` when the failed task was never registered.
    #[error("{} channel task panicked", .channel.map_or("unknown", |c| c.as_str()))]
    Panicked { channel: Option<Channel> },
}

impl AgentError {
    /// Classify a codec error: I/O failures and short reads are transport
    /// errors, everything else is a protocol violation.
    pub fn frame(channel: Channel, err: FrameError) -> Self {
        match err {
            FrameError::Io(source) => Self::Transport { channel, source },
            FrameError::Truncated { .. } => Self::Transport {
                channel,
                source: io::Error::new(io::ErrorKind::UnexpectedEof, err),
            },
            source => Self::Protocol { channel, source },
        }
    }

    pub fn transport(channel: Channel, source: io::Error) -> Self {
        Self::Transport { channel, source }
    }
}
