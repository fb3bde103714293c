//! CLI command definitions and dispatch.

pub mod admin;
pub mod challenge;
pub mod images;
pub mod instance;
pub mod ps;
pub mod serve;
pub mod settings;
pub mod status;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use instancer_common::config::InstancerConfig;
use instancer_common::constants::DATA_DIR_ENV;
use instancer_runtime::service::Instancer;

/// instancer — per-team challenge instances on a container runtime.
#[derive(Parser, Debug)]
#[command(name = "instancer", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the registry, settings and challenge catalog.
    #[arg(long, global = true, env = DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start (or return) a team's instance of a challenge.
    Request(instance::PairArgs),
    /// Extend a team's instance lifetime.
    Renew(instance::PairArgs),
    /// Replace a team's instance with a fresh one.
    Reset(instance::PairArgs),
    /// Stop a team's instance.
    Stop(instance::PairArgs),
    /// Kill a tracked container by identity.
    Kill(admin::KillArgs),
    /// Kill every tracked container.
    Purge,
    /// List image tags available on the runtime.
    Images,
    /// List tracked instances.
    Ps(ps::PsArgs),
    /// Show whether the runtime is configured and reachable.
    Status,
    /// Show or change runtime settings.
    #[command(subcommand)]
    Settings(settings::SettingsCommand),
    /// Manage the challenge catalog.
    #[command(subcommand)]
    Challenge(challenge::ChallengeCommand),
    /// Run the expiration reaper until Ctrl+C.
    Serve,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the state directory cannot be opened or output
/// cannot be written. Operation failures are reported on stdout and
/// yield a failing exit code instead.
pub async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli
        .data_dir
        .map_or_else(InstancerConfig::default, InstancerConfig::with_data_dir);
    tracing::debug!(data_dir = %config.data_dir.display(), "using state directory");
    let instancer = Instancer::open(&config).map_err(|e| anyhow::anyhow!("{e}"))?;

    match cli.command {
        Command::Request(args) => instance::request(&instancer, &args).await,
        Command::Renew(args) => instance::renew(&instancer, &args).await,
        Command::Reset(args) => instance::reset(&instancer, &args).await,
        Command::Stop(args) => instance::stop(&instancer, &args).await,
        Command::Kill(args) => admin::kill(&instancer, &args).await,
        Command::Purge => admin::purge(&instancer).await,
        Command::Images => images::execute(&instancer).await,
        Command::Ps(args) => ps::execute(&instancer, &args),
        Command::Status => status::execute(&instancer).await,
        Command::Settings(cmd) => settings::execute(&instancer, cmd).await,
        Command::Challenge(cmd) => challenge::execute(&instancer, cmd),
        Command::Serve => serve::execute(&instancer).await,
    }
}

/// Connects using stored settings. A failure is logged, not fatal: the
/// operation itself retries the connection and reports the error.
pub async fn connect(instancer: &Instancer) {
    if let Err(e) = instancer.connect().await {
        tracing::warn!(error = %e, "container runtime not connected");
    }
}
