//! mcpextract CLI: extract launch configurations for MCP servers from their
//! source repositories.
//!
//! Fetches repository files, asks a model for a candidate configuration,
//! validates and scores it, and persists one reviewed record per source.

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
