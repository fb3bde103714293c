//! Container lifecycle manager.
//!
//! Reconciles the instance registry with the container runtime. Every
//! operation on a (challenge, team) pair runs under that pair's lock, and
//! every runtime call goes through the [`RetryPolicy`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use instancer_common::config::RuntimeSettings;
use instancer_common::error::{InstancerError, Result};
use instancer_common::types::{
    ChallengeDescriptor, ChallengeId, ContainerId, ContainerStatus, InstanceKey, InstanceRecord,
    TeamId,
};
use serde::Serialize;

use crate::backend::{ContainerRuntime, RunSpec};
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::limits;
use crate::locks::KeyedLocks;
use crate::registry::InstanceStore;
use crate::retry::RetryPolicy;
use crate::volumes;

/// How an acquire was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireStatus {
    /// A new container was started.
    Created,
    /// A live container already existed for the pair.
    AlreadyRunning,
}

/// Result of [`LifecycleManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Whether the container is new.
    pub status: AcquireStatus,
    /// The record now owning the pair.
    pub record: InstanceRecord,
}

/// Outcome of one expiration sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Containers whose records were evicted.
    pub reaped: Vec<ContainerId>,
    /// Kills that failed; their records were evicted anyway.
    pub kill_failures: usize,
    /// Records skipped because they were renewed or removed mid-sweep.
    pub skipped: usize,
}

/// Outcome of [`LifecycleManager::purge_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    /// Kills attempted.
    pub attempted: usize,
    /// Kills that failed.
    pub kill_failures: usize,
}

/// Orchestrates containers for (challenge, team) pairs.
pub struct LifecycleManager {
    connection: Arc<ConnectionManager>,
    registry: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    settings: RwLock<Arc<RuntimeSettings>>,
    locks: KeyedLocks<InstanceKey>,
    retry: RetryPolicy,
}

impl LifecycleManager {
    /// Creates a manager with default settings and retry policy.
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            registry,
            clock,
            settings: RwLock::new(Arc::new(RuntimeSettings::default())),
            locks: KeyedLocks::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The connection manager.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Settings currently in effect.
    #[must_use]
    pub fn settings(&self) -> Arc<RuntimeSettings> {
        Arc::clone(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in new settings for subsequent operations.
    pub fn set_settings(&self, settings: RuntimeSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    /// Returns the container for the pair, starting one if none is alive.
    ///
    /// # Errors
    ///
    /// Returns a connection, configuration, or runtime error if a new
    /// container cannot be started. The pair stays without a record.
    pub async fn acquire(
        &self,
        challenge: &ChallengeDescriptor,
        team: TeamId,
    ) -> Result<Acquired> {
        let key = InstanceKey::new(challenge.id, team);
        let _pair = self.locks.lock(key).await;

        if let Some(existing) = self.registry.find(key)? {
            let id = &existing.container_id;
            let status = self
                .runtime_call(move |rt| async move { rt.status(id).await })
                .await?;
            if status == ContainerStatus::Running {
                tracing::debug!(%key, container = %id.short(), "instance already running");
                return Ok(Acquired {
                    status: AcquireStatus::AlreadyRunning,
                    record: existing,
                });
            }
            tracing::info!(
                %key,
                container = %id.short(),
                ?status,
                "discarding stale instance record"
            );
            if status == ContainerStatus::Stopped {
                self.discard_orphan(id).await;
            }
            let _ = self.registry.remove(id)?;
        }

        let record = self.create(challenge, team).await?;
        Ok(Acquired {
            status: AcquireStatus::Created,
            record,
        })
    }

    /// Pushes the expiry of the pair's instance forward.
    ///
    /// The new expiry is never earlier than the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] if the pair has no instance.
    pub async fn renew(&self, challenge: ChallengeId, team: TeamId) -> Result<InstanceRecord> {
        let key = InstanceKey::new(challenge, team);
        let _pair = self.locks.lock(key).await;

        let record = self.registry.find(key)?.ok_or_else(|| missing_instance(key))?;
        let expires_at = record.expires_at.max(
            self.clock
                .now()
                .saturating_add(self.settings().expiration_seconds()),
        );
        let record = self.registry.set_expiry(&record.container_id, expires_at)?;
        tracing::info!(%key, expires_at, "instance renewed");
        Ok(record)
    }

    /// Kills the pair's container and forgets it.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] if the pair has no instance, or
    /// the kill failure, in which case the record is kept.
    pub async fn stop(&self, challenge: ChallengeId, team: TeamId) -> Result<InstanceRecord> {
        let key = InstanceKey::new(challenge, team);
        let _pair = self.locks.lock(key).await;

        let record = self.registry.find(key)?.ok_or_else(|| missing_instance(key))?;
        self.evict(&record).await?;
        Ok(record)
    }

    /// Kills the pair's container, if any, and starts a fresh one.
    ///
    /// # Errors
    ///
    /// Returns the kill failure (nothing is started), or any creation error.
    pub async fn reset(&self, challenge: &ChallengeDescriptor, team: TeamId) -> Result<Acquired> {
        let key = InstanceKey::new(challenge.id, team);
        let _pair = self.locks.lock(key).await;

        if let Some(existing) = self.registry.find(key)? {
            self.evict(&existing).await?;
        }
        let record = self.create(challenge, team).await?;
        Ok(Acquired {
            status: AcquireStatus::Created,
            record,
        })
    }

    /// Kills a tracked container by identity and forgets it.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] for untracked containers, or the
    /// kill failure.
    pub async fn admin_kill(&self, id: &ContainerId) -> Result<InstanceRecord> {
        let record = self
            .registry
            .get(id)?
            .ok_or_else(|| InstancerError::NotFound {
                kind: "instance",
                id: id.to_string(),
            })?;
        let _pair = self.locks.lock(record.key()).await;

        // Re-read under the lock; a concurrent stop may have won.
        let record = self
            .registry
            .get(id)?
            .ok_or_else(|| InstancerError::NotFound {
                kind: "instance",
                id: id.to_string(),
            })?;
        self.evict(&record).await?;
        Ok(record)
    }

    /// Kills every tracked container and empties the registry.
    ///
    /// Individual kill and eviction failures are logged, never returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry cannot be read.
    pub async fn purge_all(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        for record in self.registry.list()? {
            let _pair = self.locks.lock(record.key()).await;
            report.attempted += 1;
            if let Err(e) = self.kill(&record.container_id).await {
                report.kill_failures += 1;
                tracing::warn!(
                    container = %record.container_id.short(),
                    error = %e,
                    "kill failed during purge"
                );
            }
            if let Err(e) = self.registry.remove(&record.container_id) {
                tracing::error!(
                    container = %record.container_id.short(),
                    error = %e,
                    "failed to evict record during purge"
                );
            }
        }
        tracing::info!(
            attempted = report.attempted,
            failures = report.kill_failures,
            "all instances purged"
        );
        Ok(report)
    }

    /// Kills and evicts every record whose expiry has passed.
    ///
    /// Records are evicted even if their kill fails. A record renewed or
    /// removed between the scan and its turn is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error only if the initial registry scan fails.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired: Vec<_> = self
            .registry
            .list()?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();

        let mut report = SweepReport::default();
        for record in expired {
            let id = &record.container_id;
            let _pair = self.locks.lock(record.key()).await;
            match self.registry.get(id) {
                Ok(Some(current)) if current.is_expired(now) => {}
                Ok(_) => {
                    report.skipped += 1;
                    tracing::debug!(container = %id.short(), "renewed or removed since scan");
                    continue;
                }
                Err(e) => {
                    tracing::error!(container = %id.short(), error = %e, "registry read failed");
                    continue;
                }
            }

            if let Err(e) = self.kill(id).await {
                report.kill_failures += 1;
                tracing::warn!(container = %id.short(), error = %e, "failed to kill expired instance");
            }
            match self.registry.remove(id) {
                Ok(_) => {
                    tracing::info!(
                        container = %id.short(),
                        challenge = %record.challenge_id,
                        team = %record.team_id,
                        "expired instance reclaimed"
                    );
                    report.reaped.push(id.clone());
                }
                Err(e) => {
                    tracing::error!(container = %id.short(), error = %e, "failed to evict expired record");
                }
            }
        }
        Ok(report)
    }

    /// Sorted, deduplicated image tags known to the runtime.
    ///
    /// # Errors
    ///
    /// Returns a connection or runtime error.
    pub async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .runtime_call(|rt| async move { rt.list_images().await })
            .await?;
        let tags: BTreeSet<String> = images
            .into_iter()
            .flat_map(|image| image.tags)
            .filter(|tag| !tag.is_empty() && tag != "<none>:<none>")
            .collect();
        Ok(tags.into_iter().collect())
    }

    /// Every tracked instance, ordered by challenge then team.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = self.registry.list()?;
        records.sort_by_key(InstanceRecord::key);
        Ok(records)
    }

    /// Returns true if the runtime currently answers.
    pub async fn is_connected(&self) -> bool {
        self.connection.ping().await
    }

    /// Starts a container for the pair and records it. Caller holds the pair lock.
    async fn create(&self, challenge: &ChallengeDescriptor, team: TeamId) -> Result<InstanceRecord> {
        let settings = self.settings();
        let limits = limits::parse_limits(
            settings.max_memory_mb.as_deref(),
            settings.max_cpu_cores.as_deref(),
        )?;
        let binds = volumes::parse_volume_spec(&challenge.volumes)?;
        let spec = RunSpec::new(&challenge.image, challenge.internal_port)
            .command_line(&challenge.command)
            .limits(limits)
            .binds(binds);

        let spec = &spec;
        let id = self
            .runtime_call(move |rt| async move { rt.run(spec).await })
            .await?;

        let port = {
            let id = &id;
            self.runtime_call(move |rt| async move { rt.host_port(id).await })
                .await
        };
        let port = match port {
            Ok(Some(port)) => port,
            Ok(None) => {
                self.discard_orphan(&id).await;
                return Err(InstancerError::Runtime {
                    message: format!(
                        "container {} started but no host port was published",
                        id.short()
                    ),
                });
            }
            Err(e) => {
                self.discard_orphan(&id).await;
                return Err(e);
            }
        };

        let now = self.clock.now();
        let record = InstanceRecord {
            container_id: id,
            challenge_id: challenge.id,
            team_id: team,
            host_port: Some(port),
            created_at: now,
            expires_at: now.saturating_add(settings.expiration_seconds()),
        };
        if let Err(e) = self.registry.insert(record.clone()) {
            self.discard_orphan(&record.container_id).await;
            return Err(e);
        }
        tracing::info!(
            challenge = %challenge.id,
            team = %team,
            container = %record.container_id.short(),
            port,
            image = %challenge.image,
            "instance created"
        );
        Ok(record)
    }

    /// Kills a record's container then drops the record. Caller holds the pair lock.
    async fn evict(&self, record: &InstanceRecord) -> Result<()> {
        self.kill(&record.container_id).await?;
        let _ = self.registry.remove(&record.container_id)?;
        tracing::info!(
            challenge = %record.challenge_id,
            team = %record.team_id,
            container = %record.container_id.short(),
            "instance stopped"
        );
        Ok(())
    }

    /// Idempotent kill: a container the runtime no longer knows is gone.
    async fn kill(&self, id: &ContainerId) -> Result<()> {
        match self
            .runtime_call(move |rt| async move { rt.kill(id).await })
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn discard_orphan(&self, id: &ContainerId) {
        if let Err(e) = self.kill(id).await {
            tracing::warn!(container = %id.short(), error = %e, "orphaned container left running");
        }
    }

    async fn runtime_call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ContainerRuntime>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.run(&self.connection, op).await
    }
}

fn missing_instance(key: InstanceKey) -> InstancerError {
    InstancerError::NotFound {
        kind: "instance",
        id: key.to_string(),
    }
}
