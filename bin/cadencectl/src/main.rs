//! `cadencectl`: the control-channel client.
//!
//! A thin `clap`-derive front-end implementing the four CLI
//! subcommands. `start` execs the `cadenced` daemon binary; `stop`
//! and `execute` write a single frame to the daemon's control channel
//! and read the echoed acknowledgement; `status` opens the state
//! ledger read-only and prints the current-status snapshot.

use cadence_scheduler::config::SchedulerConfig;
use cadence_scheduler::ledger::StateLedger;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "cadencectl")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a new scheduler instance.
    Start {
        #[arg(long = "scheduler_name")]
        scheduler_name: String,
        #[arg(long = "config_file")]
        config_file: PathBuf,
        #[arg(long = "log_level")]
        log_level: Option<String>,
        #[arg(long, default_value = "prod")]
        mode: String,
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        wipe: bool,
    },
    /// Stop a running scheduler instance.
    Stop {
        #[arg(long = "scheduler_name")]
        scheduler_name: String,
    },
    /// Print the current open-state snapshot.
    Status {
        #[arg(long = "scheduler_name")]
        scheduler_name: String,
        #[arg(long = "routine_name")]
        routine_name: Option<String>,
    },
    /// Force-run a task, overriding its current state.
    Execute {
        #[arg(long = "scheduler_name")]
        scheduler_name: String,
        #[arg(long = "task_name")]
        task_name: String,
    },
}

fn state_dir() -> PathBuf {
    std::env::var("CADENCE_STATE_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/var/lib/cadence"))
}

#[derive(Debug)]
enum CliError {
    UnknownInstance { scheduler_name: String },
    Io(std::io::Error),
    Config(cadence_scheduler::config::ConfigError),
    Ledger(cadence_scheduler::ledger::LedgerError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownInstance { scheduler_name } => {
                write!(f, "no running instance named '{scheduler_name}'")
            }
            Self::Io(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::Ledger(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CliError {}
impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
impl From<cadence_scheduler::config::ConfigError> for CliError {
    fn from(e: cadence_scheduler::config::ConfigError) -> Self {
        Self::Config(e)
    }
}
impl From<cadence_scheduler::ledger::LedgerError> for CliError {
    fn from(e: cadence_scheduler::ledger::LedgerError) -> Self {
        Self::Ledger(e)
    }
}

/// Resolves a scheduler name to its config, via the instance registry
/// file the daemon created at launch.
fn resolve_config(scheduler_name: &str) -> Result<SchedulerConfig, CliError> {
    let instance_path = state_dir().join("instances").join(scheduler_name);
    let config_path: PathBuf = std::fs::read_to_string(&instance_path)
        .map_err(|_| CliError::UnknownInstance { scheduler_name: scheduler_name.to_string() })?
        .into();
    Ok(SchedulerConfig::load(&config_path)?)
}

async fn send_instruction(port: u16, instruction: &str) -> Result<(), CliError> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(instruction.as_bytes()).await?;

    let mut echoed = vec![0u8; instruction.len()];
    stream.read_exact(&mut echoed).await?;
    if echoed != instruction.as_bytes() {
        tracing::warn!("daemon's acknowledgement did not match the sent instruction");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("cadencectl: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Start { scheduler_name, config_file, log_level, mode, resume, wipe } => {
            start_daemon(&scheduler_name, &config_file, log_level.as_deref(), &mode, resume, wipe)
        }
        Command::Stop { scheduler_name } => {
            let config = resolve_config(&scheduler_name)?;
            let port = config.session.port.unwrap_or(0);
            send_instruction(port, "stop").await
        }
        Command::Execute { scheduler_name, task_name } => {
            let config = resolve_config(&scheduler_name)?;
            let port = config.session.port.unwrap_or(0);
            send_instruction(port, &task_name).await
        }
        Command::Status { scheduler_name, routine_name } => {
            let config = resolve_config(&scheduler_name)?;
            print_status(&config.database, routine_name.as_deref()).await
        }
    }
}

fn start_daemon(
    scheduler_name: &str,
    config_file: &Path,
    log_level: Option<&str>,
    mode: &str,
    resume: bool,
    wipe: bool,
) -> Result<(), CliError> {
    let mut command = std::process::Command::new("cadenced");
    command.arg("--scheduler_name").arg(scheduler_name).arg("--config_file").arg(config_file);
    if let Some(level) = log_level {
        command.arg("--log_level").arg(level);
    }
    tracing::debug!(mode, "launching daemon");
    if resume {
        command.arg("--resume");
    }
    if wipe {
        command.arg("--wipe");
    }

    let status = command.status()?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

async fn print_status(database: &Path, routine_name: Option<&str>) -> Result<(), CliError> {
    let ledger = StateLedger::open(database, false).await?;
    let rows = ledger.current_status(routine_name).await?;
    for row in rows {
        println!("{}\t{}\t{}\t{}", row.routine, row.instance, row.state, row.stamp);
    }
    Ok(())
}
