//! `instancer kill|purge` — admin container operations.

use std::process::ExitCode;

use clap::Args;
use instancer_common::types::ContainerId;
use instancer_runtime::service::Instancer;

use crate::output;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Full container identity, as listed by `instancer ps --json`.
    #[arg(long)]
    pub container: String,
}

/// Executes the `kill` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn kill(instancer: &Instancer, args: &KillArgs) -> anyhow::Result<ExitCode> {
    super::connect(instancer).await;
    output::emit(instancer.admin_kill(&ContainerId::new(&args.container)).await)
}

/// Executes the `purge` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn purge(instancer: &Instancer) -> anyhow::Result<ExitCode> {
    super::connect(instancer).await;
    output::emit(instancer.admin_purge_all().await)
}
