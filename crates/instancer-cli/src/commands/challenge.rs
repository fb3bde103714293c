//! `instancer challenge` — Manage the challenge catalog.

use std::process::ExitCode;

use clap::{Args, Subcommand};
use instancer_common::types::{ChallengeDescriptor, ChallengeId};
use instancer_runtime::service::{Ack, Instancer};

use crate::output;

/// Catalog subcommands.
#[derive(Subcommand, Debug)]
pub enum ChallengeCommand {
    /// Register or replace a container challenge.
    Add(AddArgs),
    /// List registered challenges.
    List,
    /// Remove a challenge.
    Remove {
        /// Challenge id.
        #[arg(long)]
        id: u64,
    },
}

/// Arguments for `challenge add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Challenge id.
    #[arg(long)]
    pub id: u64,

    /// Display name.
    #[arg(long)]
    pub name: String,

    /// Image reference to run.
    #[arg(long)]
    pub image: String,

    /// Port the challenge listens on inside the container.
    #[arg(long)]
    pub port: u16,

    /// Startup command; empty keeps the image default.
    #[arg(long, default_value = "")]
    pub command: String,

    /// Volume specification as JSON.
    #[arg(long, default_value = "")]
    pub volumes: String,

    /// Initial score.
    #[arg(long, default_value_t = 500)]
    pub initial: u32,

    /// Minimum score.
    #[arg(long, default_value_t = 100)]
    pub minimum: u32,

    /// Solves until the minimum is reached.
    #[arg(long, default_value_t = 20)]
    pub decay: u32,
}

impl From<AddArgs> for ChallengeDescriptor {
    fn from(args: AddArgs) -> Self {
        Self {
            id: ChallengeId(args.id),
            name: args.name,
            image: args.image,
            internal_port: args.port,
            command: args.command,
            volumes: args.volumes,
            initial: args.initial,
            minimum: args.minimum,
            decay: args.decay,
        }
    }
}

/// Executes a `challenge` subcommand.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub fn execute(instancer: &Instancer, cmd: ChallengeCommand) -> anyhow::Result<ExitCode> {
    match cmd {
        ChallengeCommand::Add(args) => {
            let id = args.id;
            output::emit(instancer.register_challenge(args.into()).map(|()| Ack {
                success: format!("challenge {id} registered"),
            }))
        }
        ChallengeCommand::List => output::emit(instancer.list_challenges()),
        ChallengeCommand::Remove { id } => {
            output::emit(instancer.remove_challenge(ChallengeId(id)).map(|()| Ack {
                success: format!("challenge {id} removed"),
            }))
        }
    }
}
