//! `instancer images` — List image tags on the runtime.

use std::process::ExitCode;

use instancer_runtime::service::Instancer;

use crate::output;

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn execute(instancer: &Instancer) -> anyhow::Result<ExitCode> {
    super::connect(instancer).await;
    output::emit(instancer.list_images().await)
}
