//! `instancer serve` — Keep the expiration reaper running until Ctrl+C.
//!
//! Settings changed by other invocations are picked up on the next poll
//! of the settings store.

use std::process::ExitCode;
use std::time::Duration;

use instancer_common::constants::EXPIRATION_CHECK_INTERVAL_SECS;
use instancer_runtime::service::Instancer;
use tokio::time::MissedTickBehavior;

/// Executes the `serve` command.
///
/// # Errors
///
/// Returns an error if the Ctrl+C handler cannot be installed.
pub async fn execute(instancer: &Instancer) -> anyhow::Result<ExitCode> {
    let (stop, mut stopped) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop.send(true);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    if let Err(e) = instancer.start().await {
        tracing::warn!(error = %e, "starting without a runtime connection");
    }
    let settings = instancer.show_settings().map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(
        expiration_minutes = settings.expiration_minutes,
        hostname = %settings.public_hostname,
        "instancer serving, press Ctrl+C to stop"
    );

    let mut reload = tokio::time::interval(Duration::from_secs(EXPIRATION_CHECK_INTERVAL_SECS));
    reload.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let _ = reload.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            _ = reload.tick() => {
                if let Err(e) = instancer.reload_settings().await {
                    tracing::warn!(error = %e, "failed to apply stored settings");
                }
            }
        }
    }

    tracing::info!("shutting down");
    instancer.shutdown().await;
    Ok(ExitCode::SUCCESS)
}
