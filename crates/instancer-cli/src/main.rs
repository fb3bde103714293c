//! # instancer — per-team challenge instances
//!
//! Starts, renews and reclaims one container per (challenge, team) on a
//! Docker host. Each subcommand maps to one service operation and prints
//! its result as JSON.

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli).await
}
