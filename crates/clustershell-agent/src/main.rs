//! clustershell-agent: per-node agent binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use clustershell::config::{
    DEFAULT_COORDINATOR_HOST, DEFAULT_COORDINATOR_PORT, DEFAULT_LISTEN_BACKLOG, DEFAULT_PROMPT,
    DEFAULT_REQUEST_PORT, DEFAULT_SHELL,
};
use clustershell::{Agent, AgentConfig, CLUSTERSHELL_VERSION, StderrMode, Termination};

/// Node agent for the clustershell distributed shell.
///
/// Forwards commands typed here to the coordinator and executes commands the
/// coordinator pushes to this node.
#[derive(Parser, Debug)]
#[command(name = "clustershell-agent", version, about, long_about = None)]
struct Args {
    /// Coordinator address (host:port).
    #[arg(long, env = "CLUSTERSHELL_COORDINATOR", default_value_t = default_coordinator())]
    coordinator: String,

    /// Address the request channel listens on for pushed commands.
    #[arg(long, env = "CLUSTERSHELL_LISTEN", default_value_t = default_listen())]
    listen: SocketAddr,

    /// Pending connection queue length for the request listener.
    #[arg(long, env = "CLUSTERSHELL_BACKLOG", default_value_t = DEFAULT_LISTEN_BACKLOG)]
    backlog: u32,

    /// Initial working directory for pushed commands [default: $HOME].
    #[arg(long, env = "CLUSTERSHELL_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Shell used to run pushed commands.
    #[arg(long, env = "CLUSTERSHELL_SHELL", default_value = DEFAULT_SHELL)]
    shell: PathBuf,

    /// Let pushed commands write to this agent's stderr instead of discarding it.
    #[arg(long, env = "CLUSTERSHELL_INHERIT_STDERR")]
    inherit_stderr: bool,

    /// Prompt shown before each operator command.
    #[arg(long, env = "CLUSTERSHELL_PROMPT", default_value = DEFAULT_PROMPT)]
    prompt: String,
}

fn default_coordinator() -> String {
    format!("{DEFAULT_COORDINATOR_HOST}:{DEFAULT_COORDINATOR_PORT}")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_REQUEST_PORT))
}

impl Args {
    fn into_config(self) -> AgentConfig {
        let mut config = AgentConfig::new(self.coordinator)
            .with_listen(self.listen)
            .with_backlog(self.backlog)
            .with_prompt(self.prompt)
            .with_shell(self.shell)
            .with_stderr(if self.inherit_stderr {
                StderrMode::Inherit
            } else {
                StderrMode::Discard
            });
        if self.workdir.is_some() {
            config = config.with_working_dir(self.workdir);
        }
        config
    }
}

/// Initialize tracing with CLUSTERSHELL_LOG and LOG_FORMAT support.
///
/// Logs go to stderr; stdout belongs to the operator.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("CLUSTERSHELL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "clustershell={level},clustershell_agent={level}",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Cancel the agent on Ctrl+C.
fn watch_ctrl_c(agent: &Agent) {
    let token = agent.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received SIGINT, shutting down..."),
                    Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
                }
                token.cancel();
            }
        }
    });
}

fn report(termination: &Termination) {
    let channel = termination
        .channel
        .map(|c| c.as_str())
        .unwrap_or("none");
    match &termination.outcome {
        Ok(reason) => info!(channel, ?reason, "Agent stopped"),
        Err(e) => {
            error!(channel, error = %e, "Agent stopped on fatal error");
            eprintln!("error: {e}");
        }
    }
}

async fn run(args: Args) -> anyhow::Result<Termination> {
    let config = args.into_config();
    let agent = Agent::start(&config, tokio::io::stdin(), tokio::io::stdout()).await?;
    watch_ctrl_c(&agent);
    Ok(agent.wait().await)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();
    info!("clustershell-agent {}", CLUSTERSHELL_VERSION);

    let code = match run(args).await {
        Ok(termination) => {
            report(&termination);
            termination.exit_code()
        }
        Err(e) => {
            error!(error = %e, "Agent failed to start");
            eprintln!("error: {e:#}");
            1
        }
    };

    // Exit without waiting for the runtime: the blocking stdin reader would
    // otherwise hold shutdown until the operator presses enter.
    process::exit(code);
}
