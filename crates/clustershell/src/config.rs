//! Agent configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::exec::StderrMode;

pub const DEFAULT_COORDINATOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_COORDINATOR_PORT: u16 = 12038;
/// Port the coordinator connects to when pushing commands.
pub const DEFAULT_REQUEST_PORT: u16 = 12345;
pub const DEFAULT_LISTEN_BACKLOG: u32 = 30;
pub const DEFAULT_PROMPT: &str = "[shell]-> ";
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `host:port` of the coordinator's command listener.
    pub coordinator: String,
    /// Address the request channel listens on.
    pub listen: SocketAddr,
    pub backlog: u32,
    pub prompt: String,
    /// Initial working directory for pushed commands. `None` keeps the
    /// directory the agent was launched in.
    pub working_dir: Option<PathBuf>,
    pub shell: PathBuf,
    pub stderr: StderrMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator: format!("{DEFAULT_COORDINATOR_HOST}:{DEFAULT_COORDINATOR_PORT}"),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REQUEST_PORT)),
            backlog: DEFAULT_LISTEN_BACKLOG,
            prompt: DEFAULT_PROMPT.to_string(),
            working_dir: std::env::var_os("HOME").map(PathBuf::from),
            shell: PathBuf::from(DEFAULT_SHELL),
            stderr: StderrMode::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(coordinator: impl Into<String>) -> Self {
        Self {
            coordinator: coordinator.into(),
            ..Self::default()
        }
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
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
