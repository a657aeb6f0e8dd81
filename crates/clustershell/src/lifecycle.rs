//! Lifecycle coordinator for the two channel tasks.
//!
//! Both channels run as independent tasks sharing one [`CancellationToken`].
//! Whichever task finishes first, cleanly or not, cancels the token; the
//! other task is then aborted without draining. The agent has no state in
//! which only one channel is alive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use tokio::task::{Id, JoinSet};
pub use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// One of the agent's two coordinator connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Operator commands out, aggregated output back.
    Command,
    /// Coordinator-pushed execution requests.
    Request,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Request => "request",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a channel task stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator typed `exit`.
    OperatorExit,
    /// Operator input reached end of file.
    OperatorInputClosed,
    /// The shared token was cancelled by the other channel or a signal.
    Cancelled,
}

pub type ChannelResult = Result<StopReason, AgentError>;

/// How the agent ended: the channel that finished first and its outcome.
#[derive(Debug)]
pub struct Termination {
    pub channel: Option<Channel>,
    pub outcome: ChannelResult,
}

impl Termination {
    /// Every termination is reported as failure; there is no clean exit.
    pub fn exit_code(&self) -> i32 {
        1
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

pub struct Lifecycle {
    token: CancellationToken,
    tasks: JoinSet<ChannelResult>,
    channels: HashMap<Id, Channel>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            channels: HashMap::new(),
        }
    }

    /// The shared token. Cancelling it stops every channel.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start a channel task. `start` receives a clone of the shared token.
    pub fn spawn<F, Fut>(&mut self, channel: Channel, start: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ChannelResult> + Send + 'static,
    {
        let token = self.token.clone();
        let work = start(token.clone());
        let handle = self.tasks.spawn(async move {
            let outcome = work.await;
            token.cancel();
            outcome
        });
        self.channels.insert(handle.id(), channel);
        tracing::debug!(%channel, "Channel task started");
    }

    /// Wait for the first channel to stop, then tear down the rest.
    pub async fn wait(mut self) -> Termination {
        let first = self.tasks.join_next_with_id().await;
        self.token.cancel();
        self.tasks.shutdown().await;

        match first {
            Some(Ok((id, outcome))) => Termination {
                channel: self.channels.get(&id).copied(),
                outcome,
            },
            Some(Err(e)) => {
                let channel = self.channels.get(&e.id()).copied();
                tracing::error!(channel = ?channel, error = %e, "Channel task failed");
                Termination {
                    channel,
                    outcome: Err(AgentError::Panicked { channel }),
                }
            }
            None => Termination {
                channel: None,
                outcome: Ok(StopReason::Cancelled),
            },
        }
    }
}
