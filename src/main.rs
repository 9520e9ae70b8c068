use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "evreader")]
#[command(about = "Replay recorded input-event streams through the reader pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(long, env = "EVREADER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recording and print the dispatched events
    Replay {
        /// Recorded event stream
        recording: PathBuf,
    },
    /// Decode a recording and print the raw events
    Dump {
        /// Recorded event stream
        recording: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay { recording } => {
            evreader::replay::run_replay(cli.config.as_deref(), &recording)
        }
        Command::Dump { recording } => evreader::replay::run_dump(&recording),
    }
}
