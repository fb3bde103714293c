//! Reconnect-and-retry around runtime calls.

use std::future::Future;
use std::sync::Arc;

use instancer_common::error::{ConnectionFailure, InstancerError, Result};

use crate::backend::ContainerRuntime;
use crate::connection::ConnectionManager;

/// Decides which failures earn one reconnect and one retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    retryable: fn(&InstancerError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(InstancerError::is_transport)
    }
}

impl RetryPolicy {
    /// Creates a policy that retries errors matching `retryable`.
    #[must_use]
    pub const fn new(retryable: fn(&InstancerError) -> bool) -> Self {
        Self { retryable }
    }

    /// Returns true if `err` should trigger a reconnect.
    #[must_use]
    pub fn is_retryable(&self, err: &InstancerError) -> bool {
        (self.retryable)(err)
    }

    /// Runs `op` against the current runtime handle.
    ///
    /// A missing handle is connected first. A retryable failure triggers
    /// exactly one reconnect and one more attempt; if that attempt also
    /// fails for a retryable reason the caller gets a connection error.
    /// Other failures propagate untouched.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, or the reconnect failure.
    pub async fn run<T, F, Fut>(&self, connection: &ConnectionManager, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ContainerRuntime>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (handle, fresh) = match connection.current() {
            Some(handle) => (handle, false),
            None => (connection.reconnect(None).await?, true),
        };

        match op(Arc::clone(handle.runtime())).await {
            Err(e) if self.is_retryable(&e) => {
                if fresh {
                    return Err(connection_lost(&e));
                }
                tracing::warn!(
                    generation = handle.generation(),
                    error = %e,
                    "runtime call failed, reconnecting once"
                );
                let handle = connection.reconnect(Some(handle.generation())).await?;
                op(Arc::clone(handle.runtime())).await.map_err(|e| {
                    if self.is_retryable(&e) {
                        connection_lost(&e)
                    } else {
                        e
                    }
                })
            }
            other => other,
        }
    }
}

fn connection_lost(cause: &InstancerError) -> InstancerError {
    tracing::error!(error = %cause, "runtime call failed after reconnect");
    InstancerError::Connection {
        kind: ConnectionFailure::Transport,
        message: "connection to the container runtime was lost, try again later".into(),
    }
}
