//! RegTruth CLI: operator entry point for the regulatory-truth pipeline.
//!
//! Discovers regulatory documents, runs them through the stage queues, and
//! exposes backfill, review and inspection commands.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
