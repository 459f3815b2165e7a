//! slotd: the SlotGrid daemon.
//!
//! Starts an in-process cluster (masters, slaves, executors) from
//! `slotd.toml` and runs one framework against it until the framework's
//! todo is met or Ctrl-C stops it.
//!
//! # Usage
//!
//! ```text
//! slotd run --todo 5 --duration-ms 500
//! slotd run --todo 2 --nested-master nested --nested-todo 5
//! slotd init > slotd.toml
//! ```

mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "slotd", about = "SlotGrid daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a framework against an in-process cluster.
    Run(run::RunArgs),
    /// Print a scaffold slotd.toml with one nested level.
    Init {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,slotd=debug,slotgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run::run(args).await,
        Command::Init { output } => init(output),
    }
}

fn init(output: Option<PathBuf>) -> anyhow::Result<()> {
    let scaffold = slot_core::SlotConfig::scaffold().to_toml_string()?;
    match output {
        Some(path) => {
            std::fs::write(&path, scaffold)?;
            tracing::info!(path = %path.display(), "wrote scaffold config");
        }
        None => print!("{scaffold}"),
    }
    Ok(())
}
