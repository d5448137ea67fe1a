//! tunebook CLI — hymn-to-tune metadata pipeline.
//!
//! Scrapes tune candidates for a hymn catalogue, classifies them with
//! majority-voted LLM judgments, and exports a verified index.

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
