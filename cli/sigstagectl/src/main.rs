//! sigstagectl (sigstage) - staged signing of container images
//!
//! Signs images against a throwaway local registry, keeps the verified
//! signatures on disk, and publishes them to the real registry later.

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod error;
mod logging;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
