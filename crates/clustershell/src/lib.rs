//! clustershell: node agent for a distributed shell.
//!
//! An agent holds two connections to the coordinator. The command channel
//! forwards lines typed by the local operator and prints the aggregated
//! output; the request channel accepts commands pushed by the coordinator,
//! runs them locally and replies with their output. Both run under one
//! lifecycle: when either stops, the agent stops.
//!
//! Only unix hosts are supported; commands run through `/bin/sh`.

mod version;

pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod exec;
pub mod lifecycle;
pub mod request;
pub mod shell;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use exec::{ExecError, ExecutionEngine, StderrMode, WorkingDir};
pub use lifecycle::{CancellationToken, Channel, Lifecycle, StopReason, Termination};
pub use request::RequestChannel;
pub use shell::CommandChannel;
pub use version::CLUSTERSHELL_VERSION;
