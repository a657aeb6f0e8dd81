//! Agent startup: connect, bind, and launch both channels.
//!
//! Flow:
//! 1. Resolve the initial working directory for pushed commands
//! 2. Connect the command channel to the coordinator
//! 3. Bind the request channel listener
//! 4. Run both channels under one [`Lifecycle`]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::exec::{ExecutionEngine, ShellSpawner, WorkingDir};
use crate::lifecycle::{Channel, Lifecycle, Termination};
use crate::request::{RequestChannel, bind_listener};
use crate::shell::CommandChannel;

/// A running agent.
pub struct Agent {
    lifecycle: Lifecycle,
    request_addr: SocketAddr,
}

impl Agent {
    /// Connect to the coordinator and start both channels.
    ///
    /// Fails before anything is spawned if the coordinator is unreachable
    /// or the request listener cannot be bound.
    pub async fn start<I, O>(
        config: &AgentConfig,
        operator_input: I,
        console: O,
    ) -> Result<Self, AgentError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let cwd = initial_working_dir(config).await;
        tracing::info!(cwd = %cwd.path().display(), "Working directory");

        let coordinator = TcpStream::connect(&config.coordinator)
            .await
            .map_err(|source| AgentError::Connect {
                addr: config.coordinator.clone(),
                source,
            })?;
        tracing::info!(coordinator = %config.coordinator, "Connected to coordinator");

        let listener =
            bind_listener(config.listen, config.backlog).map_err(|source| AgentError::Bind {
                addr: config.listen.to_string(),
                source,
            })?;
        let request_addr = listener
            .local_addr()
            .map_err(|e| AgentError::transport(Channel::Request, e))?;
        tracing::info!(%request_addr, "Listening for coordinator requests");

        let spawner = ShellSpawner::new()
            .with_shell(&config.shell)
            .with_stderr(config.stderr);
        let engine = ExecutionEngine::new(cwd).with_spawner(Arc::new(spawner));

        let command_channel = CommandChannel::new(coordinator, operator_input, console)
            .with_prompt(config.prompt.clone());
        let request_channel = RequestChannel::new(listener, engine);

        let mut lifecycle = Lifecycle::new();
        lifecycle.spawn(Channel::Command, |token| command_channel.run(token));
        lifecycle.spawn(Channel::Request, |token| request_channel.run(token));

        Ok(Self {
            lifecycle,
            request_addr,
        })
    }

    /// Address the request channel is listening on.
    pub fn request_addr(&self) -> SocketAddr {
        self.request_addr
    }

    /// Cancelling this token terminates the agent.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.lifecycle.token()
    }

    /// Wait for either channel to stop; the other is torn down with it.
    pub async fn wait(self) -> Termination {
        self.lifecycle.wait().await
    }
}

/// The configured directory if it exists, else the launch directory.
async fn initial_working_dir(config: &AgentConfig) -> WorkingDir {
    if let Some(dir) = &config.working_dir {
        match WorkingDir::open(dir).await {
            Ok(cwd) => return cwd,
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Couldn't change to initial working directory"
                );
            }
        }
    }
    WorkingDir::current().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Launch directory unavailable, using /");
        WorkingDir::new("/")
    })
}
