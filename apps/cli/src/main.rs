//! Parley CLI — per-user chat server with streamed, rendered answers.
//!
//! `parley serve` exposes the submit/subscribe streaming protocol and the
//! immediate exchange over HTTP.

mod commands;
mod server;

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
