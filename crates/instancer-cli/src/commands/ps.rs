//! `instancer ps` — List tracked instances.

use std::process::ExitCode;

use clap::Args;
use instancer_runtime::service::Instancer;

use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Print records as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// Reads the registry only; the runtime is not contacted.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub fn execute(instancer: &Instancer, args: &PsArgs) -> anyhow::Result<ExitCode> {
    if args.json {
        return output::emit(instancer.list_instances());
    }
    match instancer.list_instances() {
        Ok(records) => {
            output::print_instances(&records);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => output::emit::<()>(Err(e)),
    }
}
