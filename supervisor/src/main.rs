use clap::Parser;
use std::{path::PathBuf, process::ExitCode, time::Duration};
use supervisor::{
    config::{self, Paths},
    reconcile::{Settings, Supervisor, SupervisorError},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run queued experiment jobs under memory and time limits
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// supervisor root holding config.json, jobs/ and completed/
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// seconds to sleep between reconciliation cycles
    #[arg(long, default_value_t = 5)]
    interval: u64,
    /// memory available to jobs in bytes, defaults to the host memory
    #[arg(long)]
    memory_budget: Option<u64>,
    /// run a single cycle and exit
    #[arg(long)]
    once: bool,
}

fn run(cli: Cli) -> Result<(), SupervisorError> {
    let memory_budget = match cli.memory_budget {
        Some(budget) => budget,
        None => config::host_memory()?,
    };
    let settings = Settings {
        paths: Paths::new(cli.root),
        memory_budget,
        interval: Duration::from_secs(cli.interval),
    };

    info!(
        queue = ?settings.paths.queue,
        archive = ?settings.paths.archive,
        memory_budget,
        "Starting supervisor"
    );

    let mut supervisor = Supervisor::new(settings)?;

    if cli.once {
        supervisor.cycle().map(|_| ())
    } else {
        supervisor.run()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("Supervisor stopped: {error}");
            ExitCode::FAILURE
        }
    }
}
