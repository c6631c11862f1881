//! CLI commands module.

mod helpers;
mod profiles;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use profiles::cmd_profiles;
pub use run::{cmd_run, RunArgs};

#[derive(Parser)]
#[command(name = "dockjail", version, about = "Run untrusted code in throwaway Docker containers")]
struct Cli {
    /// Config file (default: ~/.dockjail/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command once in a fresh sandbox and print the result.
    /// Example: `dockjail run python -c 'python3 main.py' --file main.py=./main.py`
    Run(RunArgs),

    /// List configured profiles.
    Profiles,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => cmd_run(config, args).await,
        Commands::Profiles => cmd_profiles(config).await,
    }
}
