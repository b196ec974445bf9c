//! `cadenced`: the job scheduler daemon.
//!
//! Parses the `start` launch parameters, acquires the
//! instance registration, loads the registry and ledger, and runs the
//! [`cadence_scheduler::TaskManager`] main loop until a `stop`
//! instruction arrives over the control channel.

use cadence_scheduler::config::SchedulerConfig;
use cadence_scheduler::event::Event;
use cadence_scheduler::instance::InstanceGuard;
use cadence_scheduler::ledger::StateLedger;
use cadence_scheduler::manager::TaskManager;
use cadence_scheduler::{ControlChannel, Registry};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Job scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "cadenced")]
struct Cli {
    /// Unique name for this running instance.
    #[arg(long = "scheduler_name")]
    scheduler_name: String,

    /// Path to the scheduler's config file.
    #[arg(long = "config_file")]
    config_file: PathBuf,

    /// Log level override, forwarded to `RUST_LOG` if set.
    #[arg(long = "log_level")]
    log_level: Option<String>,

    /// Resume from the ledger's open-state snapshot and the config's
    /// `last_shutdown` marker.
    #[arg(long)]
    resume: bool,

    /// Truncate the state ledger on launch.
    #[arg(long)]
    wipe: bool,
}

/// The fixed subdirectory instance registrations live under,
/// overridable for tests and non-default deployments.
fn state_dir() -> PathBuf {
    std::env::var("CADENCE_STATE_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/var/lib/cadence"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(error) = run(&cli).await {
        tracing::error!(%error, "cadenced exited with a fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SchedulerConfig::load(&cli.config_file)?;
    tracing::info!(scheduler_name = %cli.scheduler_name, config = %cli.config_file.display(), "loaded configuration");

    let guard = match InstanceGuard::acquire(&state_dir(), &cli.scheduler_name, &cli.config_file) {
        Ok(guard) => guard,
        Err(error) => {
            tracing::error!(%error, "failed to acquire instance registration");
            return Err(Box::new(error));
        }
    };

    let result = run_daemon(&mut config, cli).await;
    if result.is_err() {
        guard.release();
    }
    result
}

async fn run_daemon(config: &mut SchedulerConfig, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let definitions = cadence_registry::load_from_path(&config.registry)?;
    let registry = Registry::from_definitions(definitions)?;
    tracing::info!(routine_count = registry.len(), "loaded registry");

    let ledger = StateLedger::open(&config.database, cli.wipe).await?;

    let control = ControlChannel::bind().await?;
    config.session.port = Some(control.port());
    config.save()?;
    tracing::info!(port = control.port(), "control channel listening");

    let mut manager = TaskManager::launch(
        registry,
        ledger,
        config.log_directory.clone(),
        cli.resume,
        config.last_shutdown,
    )
    .await?;

    tokio::spawn(control.run(manager.events_sender()));

    let shutdown_signal_events = manager.events_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt signal, requesting shutdown");
            let _ = shutdown_signal_events.send(Event::Control("stop".to_string()));
        }
    });

    manager.run(config).await?;
    tracing::info!("cadenced shut down cleanly");
    Ok(())
}
