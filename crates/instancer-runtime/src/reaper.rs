//! Expiration reaper: periodic reclaim of expired instances.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::manager::LifecycleManager;

/// Handle to a running reaper task.
///
/// Dropping the handle also stops the task at its next wakeup, but only
/// [`Reaper::shutdown`] guarantees no sweep is still in flight.
#[derive(Debug)]
pub struct Reaper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Spawns a task sweeping every `interval`.
    #[must_use]
    pub fn spawn(manager: Arc<LifecycleManager>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = interval.as_secs_f64(), "expiration reaper started");
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => sweep(&manager).await,
                }
            }
            tracing::info!("expiration reaper stopped");
        });
        Self { stop, handle }
    }

    /// Stops the task and waits for any in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "expiration reaper task failed");
        }
    }

    /// Returns true once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn sweep(manager: &LifecycleManager) {
    match manager.sweep_expired().await {
        Ok(report) if !report.reaped.is_empty() || report.kill_failures > 0 => {
            tracing::info!(
                reaped = report.reaped.len(),
                kill_failures = report.kill_failures,
                skipped = report.skipped,
                "expiration sweep finished"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "expiration sweep failed"),
    }
}
