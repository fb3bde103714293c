//! Runtime connection management.
//!
//! The live handle is an immutable [`Connection`] that gets replaced, never
//! mutated. Readers clone the current `Arc` out of a short-lived read lock
//! and make their runtime calls without holding any lock. Replacements are
//! serialised by a separate async mutex and stamped with a generation
//! number, so a caller that saw generation N fail only reconnects if
//! nobody has replaced N in the meantime.

use std::sync::{Arc, PoisonError, RwLock};

use instancer_common::error::{InstancerError, Result};

use crate::backend::{Connector, ContainerRuntime};
use crate::endpoint::Endpoint;

/// One established runtime handle.
pub struct Connection {
    generation: u64,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Connection {
    /// Generation stamp; strictly increases with every replacement.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The runtime behind this handle.
    #[must_use]
    pub const fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }
}

#[derive(Default)]
struct Slot {
    endpoint: Option<Endpoint>,
    current: Option<Arc<Connection>>,
    generation: u64,
}

/// Owns the stored endpoint and the current runtime handle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slot: RwLock<Slot>,
    replace: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Creates a manager with no endpoint configured.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slot: RwLock::new(Slot::default()),
            replace: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the current handle, if connected.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// The stored endpoint, if any.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .endpoint
            .clone()
    }

    /// Tears down the current handle and connects to `endpoint`.
    ///
    /// `None` disables the backend. On failure the endpoint stays stored
    /// so later calls can retry.
    ///
    /// # Errors
    ///
    /// Returns the classified connection failure.
    pub async fn configure(&self, endpoint: Option<Endpoint>) -> Result<()> {
        let _replace = self.replace.lock().await;
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.endpoint.clone_from(&endpoint);
            if slot.current.take().is_some() {
                tracing::info!("previous runtime connection torn down");
            }
        }
        let Some(endpoint) = endpoint else {
            tracing::info!("no runtime endpoint configured, backend disabled");
            return Ok(());
        };
        self.establish(&endpoint).await.map(|_| ())
    }

    /// Replaces the handle after a failure observed on generation `stale`.
    ///
    /// With `stale == None` the caller saw no handle at all. If the
    /// current handle is already newer than what the caller saw, it is
    /// returned without reconnecting.
    ///
    /// # Errors
    ///
    /// Returns a `NotConfigured` connection error when disabled, or the
    /// classified connection failure.
    pub async fn reconnect(&self, stale: Option<u64>) -> Result<Arc<Connection>> {
        let _replace = self.replace.lock().await;
        let endpoint = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = &slot.current {
                if stale != Some(current.generation) {
                    return Ok(Arc::clone(current));
                }
            }
            slot.current = None;
            slot.endpoint.clone()
        };
        let Some(endpoint) = endpoint else {
            return Err(InstancerError::not_configured());
        };
        tracing::warn!(%endpoint, "reconnecting to container runtime");
        self.establish(&endpoint).await
    }

    /// Drops the current handle, keeping the endpoint.
    pub async fn disconnect(&self) {
        let _replace = self.replace.lock().await;
        let _ = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .take();
    }

    /// Returns true if the runtime answers a ping. Never fails.
    pub async fn ping(&self) -> bool {
        match self.current() {
            Some(connection) => connection.runtime().ping().await.is_ok(),
            None => false,
        }
    }

    /// Connects and installs a new handle. Caller holds `replace`.
    async fn establish(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        let runtime = match self.connector.connect(endpoint).await {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "container runtime connection failed");
                return Err(e);
            }
        };
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.generation += 1;
        let connection = Arc::new(Connection {
            generation: slot.generation,
            runtime,
        });
        slot.current = Some(Arc::clone(&connection));
        tracing::debug!(generation = slot.generation, "runtime handle installed");
        Ok(connection)
    }
}
