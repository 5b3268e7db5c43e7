#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use courier::{Config, Courier, find_config_file};
use courier_common::logging;
use courier_queue::enroll::Candidate;

/// At-least-once email dispatch
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Queue and send batched email", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $COURIER_CONFIG, then
    /// ./courier.config.ron, then /etc/courier/courier.config.ron)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve `POST /dispatch`, plus scheduled runs if an interval is set
    Serve,
    /// Run the dispatcher once and print the report as JSON
    ///
    /// Exits with status 1 if the run halted on an authentication failure or
    /// throttling.
    Dispatch,
    /// Queue recipients from a JSON array of candidates
    Enroll {
        /// File containing `[{"email": ..., "name": ..., "language": ...}]`
        candidates: PathBuf,
    },
    /// Print the number of entries in each state as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init();

    let config = Config::load(&find_config_file(cli.config)?)?;
    let courier = Courier::from_config(config).await?;

    match cli.command {
        Commands::Serve => {
            courier.serve().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Dispatch => {
            let report = courier.dispatch().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.halt().is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Enroll { candidates } => {
            let text = std::fs::read_to_string(&candidates).map_err(|e| {
                anyhow::anyhow!("Failed to read {}: {}", candidates.display(), e)
            })?;
            let candidates: Vec<Candidate> = serde_json::from_str(&text)?;
            let report = courier.enroll(candidates).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let counts = courier.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
