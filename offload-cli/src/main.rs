// Offload CLI
// Partition, plan and simulate remote runs of photogrammetry graphs

mod commands;
mod output;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use offload_service::OffloadConfig;

use commands::partition::PartitionArgs;
use commands::plan::PlanArgs;
use commands::simulate::SimulateArgs;

/// Offload photogrammetry graphs to a remote compute cluster
#[derive(Parser, Debug)]
#[command(name = "offload", version, about)]
struct Cli {
    /// Configuration file (default: <config dir>/offload/config.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show how a graph splits into accelerated and standard runs
    Partition(PartitionArgs),
    /// Build the job a graph would be submitted as, without sending it
    Plan(PlanArgs),
    /// Run a graph end to end against an in-memory cluster
    Simulate(SimulateArgs),
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<OffloadConfig> {
    let config = match path {
        Some(path) => OffloadConfig::load(path)?,
        None => OffloadConfig::discover()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Partition(args) => commands::partition::execute(args, config),
        Command::Plan(args) => commands::plan::execute(args, config),
        Command::Simulate(args) => commands::simulate::execute(args, config).await,
    }
}
