//! Tilefetch CLI - load simulation for the tile fetch scheduler
//!
//! Drives a [`tilefetch::Scheduler`] against a synthetic raster source and
//! reports the order in which requests were serviced.

mod commands;
mod error;
mod synthetic;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::simulate::{self, SimulateArgs};
use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "tilefetch")]
#[command(version, about = "Priority-ordered tile fetch scheduler tools", long_about = None)]
struct Cli {
    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a random workload against a synthetic raster and report the
    /// execution order
    Simulate(SimulateArgs),
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Simulate(args) => simulate::run(args),
    }
}

/// Installs the global tracing subscriber.
///
/// `--verbose` forces `debug`; otherwise `RUST_LOG` applies, defaulting to
/// `info`.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["tilefetch", "simulate"]).unwrap();
        assert!(!cli.verbose);
        let Commands::Simulate(args) = cli.command;
        assert_eq!(args.requests, 200);
        assert!(args.viewpoint.is_none());
    }

    #[test]
    fn test_parse_global_verbose() {
        let cli = Cli::try_parse_from([
            "tilefetch",
            "simulate",
            "--verbose",
            "--requests",
            "10",
            "--viewpoint",
            "53.5,10.0",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Simulate(args) = cli.command;
        assert_eq!(args.requests, 10);
        assert_eq!(args.viewpoint.map(|point| point.lat), Some(53.5));
    }

    #[test]
    fn test_rejects_bad_viewpoint() {
        assert!(Cli::try_parse_from(["tilefetch", "simulate", "--viewpoint", "north"]).is_err());
    }
}
