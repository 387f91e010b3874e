//! Stitcher CLI: merge remote case documents into one published bundle.
//!
//! Reads bundle definitions, runs them through the stitch pipeline, and
//! records every task in the local task database.

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
