//! The `Instancer` service: the operations route handlers call.
//!
//! Wires the stores, the connection manager, and the lifecycle manager
//! together, owns the expiration reaper, and shapes results into the
//! structures returned to callers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use instancer_common::config::{InstancerConfig, RuntimeSettings};
use instancer_common::constants::EXPIRATION_CHECK_INTERVAL_SECS;
use instancer_common::error::{InstancerError, Result};
use instancer_common::types::{
    ChallengeDescriptor, ChallengeId, ContainerId, InstanceRecord, TeamId,
};
use serde::Serialize;

use crate::backend::Connector;
use crate::catalog::{ChallengeCatalog, JsonCatalog};
use crate::clock::{Clock, SystemClock};
use crate::connection::ConnectionManager;
use crate::docker::DockerConnector;
use crate::endpoint::Endpoint;
use crate::limits;
use crate::manager::{AcquireStatus, Acquired, LifecycleManager};
use crate::reaper::Reaper;
use crate::registry::{InstanceStore, JsonFileStore};
use crate::settings::{JsonSettingsStore, SettingsStore};

/// Where a team's instance can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceGrant {
    /// Whether the container was started by this call.
    pub status: AcquireStatus,
    /// Public hostname of the runtime host.
    pub host: String,
    /// Published host port.
    pub port: u16,
    /// Expiry as a Unix timestamp.
    pub expires: i64,
}

/// New expiry after a renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenewGrant {
    /// Expiry as a Unix timestamp.
    pub expires: i64,
}

/// Plain acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// What was done.
    pub success: String,
}

impl Ack {
    fn new(message: impl Into<String>) -> Self {
        Self {
            success: message.into(),
        }
    }
}

/// Image tags available to challenges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageList {
    /// Sorted, deduplicated tags.
    pub images: Vec<String>,
}

/// State of the runtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// An endpoint is stored.
    pub configured: bool,
    /// The runtime answered a ping.
    pub connected: bool,
    /// The stored endpoint.
    pub endpoint: Option<String>,
}

/// Structured error returned at the operation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    /// User-facing message.
    pub error: String,
    /// HTTP-equivalent status.
    pub status: u16,
}

impl From<&InstancerError> for ErrorReply {
    fn from(err: &InstancerError) -> Self {
        Self {
            error: err.to_string(),
            status: err.status_code(),
        }
    }
}

/// Per-team challenge instance service.
pub struct Instancer {
    manager: Arc<LifecycleManager>,
    catalog: Arc<dyn ChallengeCatalog>,
    settings: Arc<dyn SettingsStore>,
    reaper: tokio::sync::Mutex<Option<Reaper>>,
    reaper_interval: Duration,
    reaping: AtomicBool,
}

impl Instancer {
    /// Assembles a service from its collaborators.
    ///
    /// Stored settings take effect immediately, so operations that never
    /// touch the runtime (renew, listings) honour them without a
    /// [`Instancer::connect`]. An unreadable store leaves the defaults.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<dyn InstanceStore>,
        catalog: Arc<dyn ChallengeCatalog>,
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(connector));
        let manager = LifecycleManager::new(connection, registry, clock);
        match settings.settings() {
            Ok(stored) => manager.set_settings(stored),
            Err(e) => tracing::warn!(error = %e, "stored settings unreadable, using defaults"),
        }
        Self {
            manager: Arc::new(manager),
            catalog,
            settings,
            reaper: tokio::sync::Mutex::new(None),
            reaper_interval: Duration::from_secs(EXPIRATION_CHECK_INTERVAL_SECS),
            reaping: AtomicBool::new(false),
        }
    }

    /// Opens the file-backed stores under `config` and targets Docker.
    ///
    /// # Errors
    ///
    /// Returns an error if a state file's directory cannot be created.
    pub fn open(config: &InstancerConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(DockerConnector::new()),
            Arc::new(JsonFileStore::open(&config.registry_file)?),
            Arc::new(JsonCatalog::open(&config.catalog_file)?),
            Arc::new(JsonSettingsStore::open(&config.settings_file)?),
            Arc::new(SystemClock),
        ))
    }

    /// Overrides how often the reaper sweeps.
    #[must_use]
    pub const fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// The lifecycle manager.
    #[must_use]
    pub const fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Loads stored settings and connects, without a reaper.
    ///
    /// Used by one-shot commands. A connection failure is returned but
    /// leaves the service usable: the next runtime call retries.
    ///
    /// # Errors
    ///
    /// Returns a settings or connection error.
    pub async fn connect(&self) -> Result<()> {
        let settings = self.settings.settings()?;
        self.apply(settings).await
    }

    /// Loads stored settings, connects, and installs the reaper.
    ///
    /// # Errors
    ///
    /// Returns a settings or connection error. The reaper is installed
    /// even if the first connection attempt fails.
    pub async fn start(&self) -> Result<()> {
        self.reaping.store(true, Ordering::SeqCst);
        self.connect().await
    }

    /// Re-reads the settings store and applies it if it differs from the
    /// settings in effect. Returns true if anything was applied.
    ///
    /// Lets a long-running service pick up `settings set` from another
    /// process: the reaper is cancelled and reinstalled and the runtime is
    /// reconnected exactly as for a local [`Instancer::update_settings`].
    ///
    /// # Errors
    ///
    /// Returns a settings read error, or the connection error after the
    /// new settings were applied.
    pub async fn reload_settings(&self) -> Result<bool> {
        let stored = self.settings.settings()?;
        if *self.manager.settings() == stored {
            return Ok(false);
        }
        tracing::info!(
            endpoint = %stored.connection_endpoint,
            expiration_minutes = stored.expiration_minutes,
            "stored settings changed, applying"
        );
        self.apply(stored).await?;
        Ok(true)
    }

    /// Cancels the reaper and drops the runtime connection.
    pub async fn shutdown(&self) {
        self.reaping.store(false, Ordering::SeqCst);
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.shutdown().await;
        }
        self.manager.connection().disconnect().await;
    }

    /// Returns true while a reaper task is installed.
    pub async fn reaper_running(&self) -> bool {
        self.reaper
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.is_finished())
    }

    /// Validates and stores a submitted settings form, then applies it.
    ///
    /// The reaper is cancelled and joined before anything else changes.
    /// The runtime is reconnected only if the endpoint changed or no
    /// connection exists.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::Config`] if the form is invalid (nothing
    /// is stored), or the connection error after the settings were stored.
    pub async fn update_settings(&self, form: &BTreeMap<String, String>) -> Result<()> {
        let settings = RuntimeSettings::from_form(form)?;
        let _ = limits::parse_limits(
            settings.max_memory_mb.as_deref(),
            settings.max_cpu_cores.as_deref(),
        )?;
        let _ = Endpoint::parse(&settings.connection_endpoint)?;

        self.settings.store(&settings.to_pairs())?;
        tracing::info!(
            endpoint = %settings.connection_endpoint,
            expiration_minutes = settings.expiration_minutes,
            "settings updated"
        );
        self.apply(settings).await
    }

    /// Current settings as stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store cannot be read.
    pub fn show_settings(&self) -> Result<RuntimeSettings> {
        self.settings.settings()
    }

    /// Returns the team's instance of a challenge, starting one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] for unknown challenges, or any
    /// connection, configuration, or runtime error from the start.
    pub async fn request(&self, challenge: ChallengeId, team: TeamId) -> Result<InstanceGrant> {
        let descriptor = self.catalog.get(challenge)?;
        let acquired = self.manager.acquire(&descriptor, team).await?;
        self.grant(acquired)
    }

    /// Extends the team's instance lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] if the team has no instance.
    pub async fn renew(&self, challenge: ChallengeId, team: TeamId) -> Result<RenewGrant> {
        let record = self.manager.renew(challenge, team).await?;
        Ok(RenewGrant {
            expires: record.expires_at,
        })
    }

    /// Replaces the team's instance with a fresh one.
    ///
    /// # Errors
    ///
    /// Same as [`Instancer::request`], plus a failed kill of the old one.
    pub async fn reset(&self, challenge: ChallengeId, team: TeamId) -> Result<InstanceGrant> {
        let descriptor = self.catalog.get(challenge)?;
        let acquired = self.manager.reset(&descriptor, team).await?;
        self.grant(acquired)
    }

    /// Stops the team's instance.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] if the team has no instance, or
    /// the kill failure.
    pub async fn stop(&self, challenge: ChallengeId, team: TeamId) -> Result<Ack> {
        let record = self.manager.stop(challenge, team).await?;
        Ok(Ack::new(format!(
            "container {} stopped",
            record.container_id.short()
        )))
    }

    /// Kills a tracked container by identity.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] for untracked containers, or the
    /// kill failure.
    pub async fn admin_kill(&self, id: &ContainerId) -> Result<Ack> {
        let record = self.manager.admin_kill(id).await?;
        Ok(Ack::new(format!(
            "container {} killed",
            record.container_id.short()
        )))
    }

    /// Kills every tracked container and clears the registry.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry cannot be read; kill and
    /// eviction failures are logged and counted.
    pub async fn admin_purge_all(&self) -> Result<Ack> {
        let report = self.manager.purge_all().await?;
        Ok(Ack::new(format!("{} instances purged", report.attempted)))
    }

    /// Image tags known to the runtime.
    ///
    /// # Errors
    ///
    /// Returns a connection or runtime error.
    pub async fn list_images(&self) -> Result<ImageList> {
        Ok(ImageList {
            images: self.manager.list_images().await?,
        })
    }

    /// Every tracked instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        self.manager.list_instances()
    }

    /// Whether an endpoint is set and the runtime answers.
    pub async fn connection_status(&self) -> ConnectionStatus {
        let endpoint = self.manager.connection().endpoint();
        ConnectionStatus {
            configured: endpoint.is_some(),
            connected: self.manager.is_connected().await,
            endpoint: endpoint.map(|e| e.to_string()),
        }
    }

    /// Registers or replaces a challenge descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::Config`] if the volume spec is invalid, or
    /// a catalog write error.
    pub fn register_challenge(&self, descriptor: ChallengeDescriptor) -> Result<()> {
        let _ = crate::volumes::parse_volume_spec(&descriptor.volumes)?;
        self.catalog.register(descriptor)
    }

    /// Removes a challenge descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] for unknown challenges.
    pub fn remove_challenge(&self, id: ChallengeId) -> Result<()> {
        self.catalog.remove(id)
    }

    /// Every registered challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn list_challenges(&self) -> Result<Vec<ChallengeDescriptor>> {
        self.catalog.list()
    }

    fn grant(&self, acquired: Acquired) -> Result<InstanceGrant> {
        let Acquired { status, record } = acquired;
        let port = record.host_port.ok_or_else(|| InstancerError::Runtime {
            message: format!(
                "instance {} has no published port",
                record.container_id.short()
            ),
        })?;
        Ok(InstanceGrant {
            status,
            host: self.manager.settings().public_hostname.clone(),
            port,
            expires: record.expires_at,
        })
    }

    /// Applies settings: cancel the reaper, reconnect if needed, reinstall.
    async fn apply(&self, settings: RuntimeSettings) -> Result<()> {
        let endpoint = Endpoint::parse(&settings.connection_endpoint)?;
        let mut slot = self.reaper.lock().await;
        if let Some(reaper) = slot.take() {
            reaper.shutdown().await;
        }

        let connection = self.manager.connection();
        let reconnect = connection.endpoint() != endpoint || connection.current().is_none();
        let reaper_wanted = self.reaping.load(Ordering::SeqCst)
            && settings.reaper_enabled()
            && endpoint.is_some();
        self.manager.set_settings(settings);

        let connected = if reconnect {
            connection.configure(endpoint).await
        } else {
            Ok(())
        };

        if reaper_wanted {
            *slot = Some(Reaper::spawn(Arc::clone(&self.manager), self.reaper_interval));
        } else {
            tracing::debug!("expiration reaper not installed");
        }
        connected
    }
}
