//! `instancer status` — Runtime connection indicator.

use std::process::ExitCode;

use instancer_runtime::service::Instancer;

use crate::output;

/// Executes the `status` command. Always succeeds.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn execute(instancer: &Instancer) -> anyhow::Result<ExitCode> {
    super::connect(instancer).await;
    output::print_json(&instancer.connection_status().await)?;
    Ok(ExitCode::SUCCESS)
}
