//! `instancer request|renew|reset|stop` — team-facing instance operations.

use std::process::ExitCode;

use clap::Args;
use instancer_common::types::{ChallengeId, TeamId};
use instancer_runtime::service::Instancer;

use crate::output;

/// Identifies one (challenge, team) pair.
#[derive(Args, Debug)]
pub struct PairArgs {
    /// Challenge id.
    #[arg(long)]
    pub challenge: u64,

    /// Team id.
    #[arg(long)]
    pub team: u64,
}

impl PairArgs {
    const fn pair(&self) -> (ChallengeId, TeamId) {
        (ChallengeId(self.challenge), TeamId(self.team))
    }
}

/// Executes the `request` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn request(instancer: &Instancer, args: &PairArgs) -> anyhow::Result<ExitCode> {
    let (challenge, team) = args.pair();
    super::connect(instancer).await;
    output::emit(instancer.request(challenge, team).await)
}

/// Executes the `renew` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn renew(instancer: &Instancer, args: &PairArgs) -> anyhow::Result<ExitCode> {
    let (challenge, team) = args.pair();
    output::emit(instancer.renew(challenge, team).await)
}

/// Executes the `reset` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn reset(instancer: &Instancer, args: &PairArgs) -> anyhow::Result<ExitCode> {
    let (challenge, team) = args.pair();
    super::connect(instancer).await;
    output::emit(instancer.reset(challenge, team).await)
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn stop(instancer: &Instancer, args: &PairArgs) -> anyhow::Result<ExitCode> {
    let (challenge, team) = args.pair();
    super::connect(instancer).await;
    output::emit(instancer.stop(challenge, team).await)
}
