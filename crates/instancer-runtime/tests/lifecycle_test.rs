//! Integration tests for the instance lifecycle.
//!
//! Drives the `Instancer` service against an in-process fake runtime:
//! 1. Acquire idempotence and stale record reclamation
//! 2. Renew, stop, reset, admin kill and purge
//! 3. Expiration sweeps and the background reaper
//! 4. Reconnect-and-retry on transport failures
//! 5. Per-pair serialisation of concurrent requests
//! 6. Settings updates, limits and the disabled backend
//! 7. One short-lived service per operation over shared state files

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use instancer_common::config::{
    InstancerConfig, KEY_CONNECTION_ENDPOINT, KEY_EXPIRATION_MINUTES, KEY_MAX_CPU_CORES,
    KEY_MAX_MEMORY_MB, KEY_PUBLIC_HOSTNAME, RuntimeSettings,
};
use instancer_common::error::{ConnectionFailure, InstancerError, Result};
use instancer_common::types::{
    ChallengeDescriptor, ChallengeId, ContainerId, ContainerStatus, InstanceKey, InstanceRecord,
    TeamId,
};
use instancer_runtime::backend::{Connector, ContainerRuntime, ImageSummary, RunSpec};
use instancer_runtime::catalog::{JsonCatalog, MemoryCatalog};
use instancer_runtime::clock::{Clock, ManualClock};
use instancer_runtime::connection::ConnectionManager;
use instancer_runtime::endpoint::Endpoint;
use instancer_runtime::manager::{AcquireStatus, LifecycleManager};
use instancer_runtime::registry::{InstanceStore, JsonFileStore, MemoryStore};
use instancer_runtime::retry::RetryPolicy;
use instancer_runtime::service::{ErrorReply, Instancer};
use instancer_runtime::settings::{JsonSettingsStore, MemorySettingsStore, SettingsStore};

const T0: i64 = 1_700_000_000;
const WEB: ChallengeId = ChallengeId(1);
const PWN: ChallengeId = ChallengeId(2);
const BROKEN: ChallengeId = ChallengeId(3);

// ── Fake runtime ─────────────────────────────────────────────────────

#[derive(Default)]
struct DaemonState {
    next: u64,
    running: HashMap<ContainerId, (bool, u16)>,
    specs: Vec<RunSpec>,
    kills: Vec<ContainerId>,
    refuse_kill: HashSet<ContainerId>,
    transport_failures: usize,
    publish_ports: bool,
    images: Vec<ImageSummary>,
}

/// One shared "daemon" behind every connection.
struct FakeDaemon {
    state: Mutex<DaemonState>,
    run_delay: Mutex<Option<Duration>>,
}

impl FakeDaemon {
    fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState {
                publish_ports: true,
                ..DaemonState::default()
            }),
            run_delay: Mutex::new(None),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut DaemonState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn take_transport_failure(&self) -> Result<()> {
        self.with(|s| {
            if s.transport_failures > 0 {
                s.transport_failures -= 1;
                return Err(InstancerError::Transport {
                    message: "connection reset by peer".into(),
                });
            }
            Ok(())
        })
    }

    fn runs(&self) -> usize {
        self.with(|s| s.specs.len())
    }

    fn kills(&self) -> Vec<ContainerId> {
        self.with(|s| s.kills.clone())
    }

    fn halt(&self, id: &ContainerId) {
        self.with(|s| {
            if let Some(entry) = s.running.get_mut(id) {
                entry.0 = false;
            }
        });
    }
}

#[async_trait]
impl ContainerRuntime for FakeDaemon {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<ContainerId> {
        self.take_transport_failure()?;
        let delay = *self.run_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if spec.image.starts_with("missing") {
            return Err(InstancerError::Runtime {
                message: format!("image not found: {}", spec.image),
            });
        }
        Ok(self.with(|s| {
            s.next += 1;
            let id = ContainerId::new(format!("{:064x}", s.next));
            let port = 30_000 + u16::try_from(s.next).unwrap();
            let _ = s.running.insert(id.clone(), (true, port));
            s.specs.push(spec.clone());
            id
        }))
    }

    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        self.take_transport_failure()?;
        Ok(self.with(|s| match s.running.get(id) {
            Some((true, _)) => ContainerStatus::Running,
            Some((false, _)) => ContainerStatus::Stopped,
            None => ContainerStatus::Missing,
        }))
    }

    async fn host_port(&self, id: &ContainerId) -> Result<Option<u16>> {
        self.take_transport_failure()?;
        self.with(|s| match s.running.get(id) {
            Some(_) if !s.publish_ports => Ok(None),
            Some((_, port)) => Ok(Some(*port)),
            None => Err(InstancerError::NotFound {
                kind: "container",
                id: id.to_string(),
            }),
        })
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        self.take_transport_failure()?;
        self.with(|s| {
            s.kills.push(id.clone());
            if s.refuse_kill.contains(id) {
                return Err(InstancerError::Runtime {
                    message: "cannot kill container: device busy".into(),
                });
            }
            let _ = s.running.remove(id);
            Ok(())
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.take_transport_failure()?;
        Ok(self.with(|s| s.images.clone()))
    }
}

struct FakeConnector {
    daemon: Arc<FakeDaemon>,
    connects: AtomicUsize,
    unreachable: AtomicBool,
}

impl FakeConnector {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Arc<dyn ContainerRuntime>> {
        let _ = self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(InstancerError::Connection {
                kind: ConnectionFailure::Timeout,
                message: "no answer".into(),
            });
        }
        Ok(Arc::clone(&self.daemon) as Arc<dyn ContainerRuntime>)
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    instancer: Arc<Instancer>,
    daemon: Arc<FakeDaemon>,
    connector: Arc<FakeConnector>,
    clock: Arc<ManualClock>,
    registry: Arc<dyn InstanceStore>,
    settings: Arc<dyn SettingsStore>,
}

impl Harness {
    /// A second service over the same daemon, registry, and settings store,
    /// as another process on the same host would have.
    fn sibling(&self) -> Instancer {
        Instancer::new(
            Arc::clone(&self.connector) as Arc<dyn Connector>,
            Arc::clone(&self.registry),
            Arc::new(catalog()),
            Arc::clone(&self.settings),
            Arc::clone(&self.clock) as _,
        )
        .with_reaper_interval(Duration::from_millis(10))
    }
}

fn challenge(id: ChallengeId, image: &str) -> ChallengeDescriptor {
    ChallengeDescriptor {
        id,
        name: format!("chal-{id}"),
        image: image.into(),
        internal_port: 1337,
        command: String::new(),
        volumes: String::new(),
        initial: 500,
        minimum: 100,
        decay: 20,
    }
}

fn catalog() -> MemoryCatalog {
    MemoryCatalog::with([
        challenge(WEB, "web:latest"),
        challenge(PWN, "pwn:latest"),
        challenge(BROKEN, "missing:latest"),
    ])
}

fn fake_connector(daemon: &Arc<FakeDaemon>) -> Arc<FakeConnector> {
    Arc::new(FakeConnector {
        daemon: Arc::clone(daemon),
        connects: AtomicUsize::new(0),
        unreachable: AtomicBool::new(false),
    })
}

fn settings() -> RuntimeSettings {
    RuntimeSettings {
        connection_endpoint: "tcp://10.0.0.5:2375".into(),
        public_hostname: "ctf.example.org".into(),
        expiration_minutes: 30,
        max_memory_mb: None,
        max_cpu_cores: None,
    }
}

fn form(endpoint: &str, expiration: &str, memory: &str, cpu: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (KEY_CONNECTION_ENDPOINT.to_string(), endpoint.to_string()),
        (KEY_PUBLIC_HOSTNAME.to_string(), "ctf.example.org".to_string()),
        (KEY_EXPIRATION_MINUTES.to_string(), expiration.to_string()),
        (KEY_MAX_MEMORY_MB.to_string(), memory.to_string()),
        (KEY_MAX_CPU_CORES.to_string(), cpu.to_string()),
    ])
}

fn harness_with(settings: &RuntimeSettings, registry: Arc<dyn InstanceStore>) -> Harness {
    let daemon = Arc::new(FakeDaemon::new());
    let connector = fake_connector(&daemon);
    let clock = Arc::new(ManualClock::new(T0));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::with_settings(settings));
    let instancer = Instancer::new(
        Arc::clone(&connector) as Arc<dyn Connector>,
        Arc::clone(&registry),
        Arc::new(catalog()),
        Arc::clone(&settings),
        Arc::clone(&clock) as _,
    )
    .with_reaper_interval(Duration::from_millis(10));
    Harness {
        instancer: Arc::new(instancer),
        daemon,
        connector,
        clock,
        registry,
        settings,
    }
}

async fn harness() -> Harness {
    let h = harness_with(&settings(), Arc::new(MemoryStore::new()));
    h.instancer.connect().await.unwrap();
    h
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ── Acquire ──────────────────────────────────────────────────────────

#[tokio::test]
async fn request_twice_returns_same_instance() {
    let h = harness().await;

    let first = h.instancer.request(WEB, TeamId(7)).await.unwrap();
    let second = h.instancer.request(WEB, TeamId(7)).await.unwrap();

    assert_eq!(first.status, AcquireStatus::Created);
    assert_eq!(second.status, AcquireStatus::AlreadyRunning);
    assert_eq!(first.port, second.port);
    assert_eq!(first.expires, second.expires);
    assert_eq!(first.host, "ctf.example.org");
    assert_eq!(first.expires, T0 + 30 * 60);
    assert_eq!(h.daemon.runs(), 1);
}

#[tokio::test]
async fn teams_get_separate_instances() {
    let h = harness().await;

    let a = h.instancer.request(WEB, TeamId(1)).await.unwrap();
    let b = h.instancer.request(WEB, TeamId(2)).await.unwrap();
    let c = h.instancer.request(PWN, TeamId(1)).await.unwrap();

    assert_ne!(a.port, b.port);
    assert_ne!(a.port, c.port);
    assert_eq!(h.instancer.list_instances().unwrap().len(), 3);
}

#[tokio::test]
async fn stale_record_is_replaced_by_fresh_container() {
    let h = harness().await;
    let first = h.instancer.request(WEB, TeamId(7)).await.unwrap();
    let old = h.registry.list().unwrap()[0].container_id.clone();

    h.daemon.halt(&old);
    let second = h.instancer.request(WEB, TeamId(7)).await.unwrap();

    assert_eq!(second.status, AcquireStatus::Created);
    assert_ne!(second.port, first.port);
    let records = h.registry.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].container_id, old);
    assert_eq!(h.daemon.runs(), 2);
    assert_eq!(h.daemon.kills(), vec![old]);
}

#[tokio::test]
async fn vanished_container_is_replaced_without_a_kill() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(7)).await.unwrap();
    let old = h.registry.list().unwrap()[0].container_id.clone();
    h.daemon.with(|s| {
        let _ = s.running.remove(&old);
    });

    let again = h.instancer.request(WEB, TeamId(7)).await.unwrap();

    assert_eq!(again.status, AcquireStatus::Created);
    assert!(h.daemon.kills().is_empty());
    assert_eq!(h.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_challenge_is_not_found() {
    let h = harness().await;
    let err = h.instancer.request(ChallengeId(99), TeamId(1)).await.unwrap_err();
    assert_eq!(ErrorReply::from(&err).status, 404);
    assert_eq!(h.daemon.runs(), 0);
}

#[tokio::test]
async fn concurrent_requests_start_one_container() {
    let h = harness().await;
    *h.daemon.run_delay.lock().unwrap() = Some(Duration::from_millis(30));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let instancer = Arc::clone(&h.instancer);
            tokio::spawn(async move { instancer.request(WEB, TeamId(4)).await })
        })
        .collect();
    let mut created = 0;
    let mut ports = HashSet::new();
    for task in tasks {
        let grant = task.await.unwrap().unwrap();
        if grant.status == AcquireStatus::Created {
            created += 1;
        }
        let _ = ports.insert(grant.port);
    }

    assert_eq!(created, 1);
    assert_eq!(ports.len(), 1);
    assert_eq!(h.daemon.runs(), 1);
    assert_eq!(h.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn unpublished_port_discards_container() {
    let h = harness().await;
    h.daemon.with(|s| s.publish_ports = false);

    let err = h.instancer.request(WEB, TeamId(1)).await.unwrap_err();

    assert!(matches!(err, InstancerError::Runtime { .. }));
    assert_eq!(h.daemon.runs(), 1);
    assert_eq!(h.daemon.kills().len(), 1);
    assert!(h.registry.list().unwrap().is_empty());
}

// ── Renew / stop / reset / kill / purge ──────────────────────────────

#[tokio::test]
async fn renew_is_monotonic() {
    let h = harness().await;
    let grant = h.instancer.request(WEB, TeamId(3)).await.unwrap();

    h.clock.advance(120);
    let renewed = h.instancer.renew(WEB, TeamId(3)).await.unwrap();
    assert_eq!(renewed.expires, T0 + 120 + 30 * 60);
    assert!(renewed.expires >= grant.expires);

    h.clock.set(T0 - 600);
    let again = h.instancer.renew(WEB, TeamId(3)).await.unwrap();
    assert_eq!(again.expires, renewed.expires);
}

#[tokio::test]
async fn renew_without_instance_is_not_found() {
    let h = harness().await;
    let err = h.instancer.renew(WEB, TeamId(3)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn renew_applies_stored_expiration_without_connecting() {
    let registry: Arc<dyn InstanceStore> = Arc::new(MemoryStore::new());
    let id = ContainerId::new("c".repeat(64));
    registry
        .insert(InstanceRecord {
            container_id: id,
            challenge_id: WEB,
            team_id: TeamId(1),
            host_port: Some(31_000),
            created_at: T0 - 1_790,
            expires_at: T0 + 10,
        })
        .unwrap();
    let h = harness_with(&settings(), registry);
    h.clock.advance(5);

    let renewed = h.instancer.renew(WEB, TeamId(1)).await.unwrap();

    assert_eq!(renewed.expires, T0 + 5 + 30 * 60);
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test]
async fn oversized_stored_expiration_never_expires_early() {
    let mut s = settings();
    s.expiration_minutes = u64::MAX;
    let h = harness_with(&s, Arc::new(MemoryStore::new()));
    h.instancer.connect().await.unwrap();

    let grant = h.instancer.request(WEB, TeamId(1)).await.unwrap();
    assert_eq!(grant.expires, i64::MAX);
    h.clock.advance(3600);
    assert_eq!(h.instancer.renew(WEB, TeamId(1)).await.unwrap().expires, i64::MAX);

    let report = h.instancer.manager().sweep_expired().await.unwrap();
    assert!(report.reaped.is_empty());
    assert_eq!(h.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn out_of_range_expiration_form_is_rejected() {
    let h = harness().await;

    let err = h
        .instancer
        .update_settings(&form("tcp://10.0.0.5:2375", &u64::MAX.to_string(), "", ""))
        .await
        .unwrap_err();

    assert!(matches!(err, InstancerError::Config { .. }));
    assert_eq!(h.instancer.show_settings().unwrap().expiration_minutes, 30);
}

#[tokio::test]
async fn stop_kills_and_forgets() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(5)).await.unwrap();
    let id = h.registry.list().unwrap()[0].container_id.clone();

    let ack = h.instancer.stop(WEB, TeamId(5)).await.unwrap();

    assert!(ack.success.contains(id.short()));
    assert_eq!(h.daemon.kills(), vec![id]);
    assert!(h.registry.list().unwrap().is_empty());
    assert!(h.instancer.stop(WEB, TeamId(5)).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn stop_of_vanished_container_still_succeeds() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(5)).await.unwrap();
    let id = h.registry.list().unwrap()[0].container_id.clone();
    h.daemon.with(|s| {
        let _ = s.running.remove(&id);
    });

    let _ = h.instancer.stop(WEB, TeamId(5)).await.unwrap();
    assert!(h.registry.list().unwrap().is_empty());
}

#[tokio::test]
async fn stop_keeps_record_when_kill_is_refused() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(5)).await.unwrap();
    let id = h.registry.list().unwrap()[0].container_id.clone();
    h.daemon.with(|s| {
        let _ = s.refuse_kill.insert(id.clone());
    });

    let err = h.instancer.stop(WEB, TeamId(5)).await.unwrap_err();

    assert!(matches!(err, InstancerError::Runtime { .. }));
    assert_eq!(h.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn reset_replaces_instance() {
    let h = harness().await;
    let first = h.instancer.request(PWN, TeamId(8)).await.unwrap();
    let old = h.registry.list().unwrap()[0].container_id.clone();

    h.clock.advance(60);
    let fresh = h.instancer.reset(PWN, TeamId(8)).await.unwrap();

    assert_eq!(fresh.status, AcquireStatus::Created);
    assert_ne!(fresh.port, first.port);
    assert_eq!(fresh.expires, T0 + 60 + 30 * 60);
    assert_eq!(h.daemon.kills(), vec![old]);
    assert_eq!(h.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_kill_by_container_identity() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(1)).await.unwrap();
    let id = h.registry.list().unwrap()[0].container_id.clone();

    let _ = h.instancer.admin_kill(&id).await.unwrap();
    assert!(h.registry.list().unwrap().is_empty());

    let err = h.instancer.admin_kill(&id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn purge_is_total_despite_kill_failures() {
    let h = harness().await;
    for team in 1..=4 {
        let _ = h.instancer.request(WEB, TeamId(team)).await.unwrap();
    }
    let records = h.registry.list().unwrap();
    h.daemon.with(|s| {
        let _ = s.refuse_kill.insert(records[0].container_id.clone());
        let _ = s.refuse_kill.insert(records[2].container_id.clone());
    });

    let ack = h.instancer.admin_purge_all().await.unwrap();

    assert!(ack.success.starts_with('4'));
    assert!(h.registry.list().unwrap().is_empty());
    let killed: HashSet<_> = h.daemon.kills().into_iter().collect();
    assert_eq!(killed.len(), 4);
    assert!(records.iter().all(|r| killed.contains(&r.container_id)));
}

/// Registry whose removals fail for chosen containers.
struct StickyStore {
    inner: MemoryStore,
    sticky: Mutex<HashSet<ContainerId>>,
}

impl InstanceStore for StickyStore {
    fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.inner.list()
    }

    fn find(&self, key: InstanceKey) -> Result<Option<InstanceRecord>> {
        self.inner.find(key)
    }

    fn get(&self, id: &ContainerId) -> Result<Option<InstanceRecord>> {
        self.inner.get(id)
    }

    fn insert(&self, record: InstanceRecord) -> Result<()> {
        self.inner.insert(record)
    }

    fn set_expiry(&self, id: &ContainerId, expires_at: i64) -> Result<InstanceRecord> {
        self.inner.set_expiry(id, expires_at)
    }

    fn remove(&self, id: &ContainerId) -> Result<Option<InstanceRecord>> {
        if self.sticky.lock().unwrap().contains(id) {
            return Err(InstancerError::Io {
                path: "instances.json".into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.remove(id)
    }
}

#[tokio::test]
async fn purge_continues_past_registry_write_failures() {
    let store = Arc::new(StickyStore {
        inner: MemoryStore::new(),
        sticky: Mutex::new(HashSet::new()),
    });
    let h = harness_with(&settings(), Arc::clone(&store) as Arc<dyn InstanceStore>);
    h.instancer.connect().await.unwrap();
    for team in 1..=3 {
        let _ = h.instancer.request(WEB, TeamId(team)).await.unwrap();
    }
    let stuck = h.registry.list().unwrap()[1].container_id.clone();
    let _ = store.sticky.lock().unwrap().insert(stuck.clone());

    let ack = h.instancer.admin_purge_all().await.unwrap();

    assert!(ack.success.starts_with('3'));
    assert_eq!(h.daemon.kills().len(), 3);
    let left = h.registry.list().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].container_id, stuck);
}

// ── Expiration ───────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_evicts_expired_records_even_when_kill_fails() {
    let h = harness().await;
    for team in 1..=3 {
        let _ = h.instancer.request(WEB, TeamId(team)).await.unwrap();
    }
    let doomed = h
        .registry
        .find(InstanceKey::new(WEB, TeamId(2)))
        .unwrap()
        .unwrap();
    h.daemon.with(|s| {
        let _ = s.refuse_kill.insert(doomed.container_id.clone());
    });

    h.clock.advance(25 * 60);
    let _ = h.instancer.renew(WEB, TeamId(3)).await.unwrap();
    h.clock.advance(10 * 60);

    let report = h.instancer.manager().sweep_expired().await.unwrap();

    assert_eq!(report.reaped.len(), 2);
    assert_eq!(report.kill_failures, 1);
    let left = h.registry.list().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].team_id, TeamId(3));
}

#[tokio::test]
async fn sweep_leaves_unexpired_records() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(1)).await.unwrap();
    h.clock.advance(30 * 60);

    let report = h.instancer.manager().sweep_expired().await.unwrap();

    assert!(report.reaped.is_empty());
    assert_eq!(h.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn reaper_reclaims_in_background() {
    let h = harness().await;
    let _ = h.instancer.request(WEB, TeamId(1)).await.unwrap();
    h.clock.advance(31 * 60);

    h.instancer.start().await.unwrap();
    assert!(h.instancer.reaper_running().await);

    let registry = Arc::clone(&h.registry);
    assert!(eventually(|| registry.list().unwrap().is_empty()).await);
    assert_eq!(h.daemon.kills().len(), 1);

    h.instancer.shutdown().await;
    assert!(!h.instancer.reaper_running().await);
}

#[tokio::test]
async fn zero_expiration_installs_no_reaper() {
    let mut s = settings();
    s.expiration_minutes = 0;
    let h = harness_with(&s, Arc::new(MemoryStore::new()));

    h.instancer.start().await.unwrap();

    assert!(!h.instancer.reaper_running().await);
}

#[tokio::test]
async fn settings_update_restarts_reaper() {
    let h = harness().await;
    h.instancer.start().await.unwrap();
    assert!(h.instancer.reaper_running().await);
    let connects = h.connector.connects();

    h.instancer
        .update_settings(&form("tcp://10.0.0.5:2375", "0", "", ""))
        .await
        .unwrap();
    assert!(!h.instancer.reaper_running().await);
    assert_eq!(h.connector.connects(), connects);

    h.instancer
        .update_settings(&form("tcp://10.0.0.6:2375", "15", "", ""))
        .await
        .unwrap();
    assert!(h.instancer.reaper_running().await);
    assert_eq!(h.connector.connects(), connects + 1);
    assert_eq!(h.instancer.show_settings().unwrap().expiration_minutes, 15);

    h.instancer.shutdown().await;
}

#[tokio::test]
async fn reload_picks_up_settings_stored_elsewhere() {
    let h = harness().await;
    h.instancer.start().await.unwrap();
    assert!(h.instancer.reaper_running().await);
    assert!(!h.instancer.reload_settings().await.unwrap());

    let admin = h.sibling();
    admin
        .update_settings(&form("tcp://10.0.0.5:2375", "0", "", ""))
        .await
        .unwrap();
    assert!(h.instancer.reaper_running().await);

    assert!(h.instancer.reload_settings().await.unwrap());
    assert!(!h.instancer.reaper_running().await);
    assert_eq!(h.instancer.manager().settings().expiration_minutes, 0);
    assert!(!h.instancer.reload_settings().await.unwrap());

    admin
        .update_settings(&form("tcp://10.0.0.6:2375", "15", "", ""))
        .await
        .unwrap();
    let connects = h.connector.connects();
    assert!(h.instancer.reload_settings().await.unwrap());
    assert!(h.instancer.reaper_running().await);
    assert_eq!(h.connector.connects(), connects + 1);
    assert_eq!(
        h.instancer.connection_status().await.endpoint.as_deref(),
        Some("tcp://10.0.0.6:2375")
    );

    h.instancer.shutdown().await;
}

#[tokio::test]
async fn reloaded_expiration_applies_to_new_instances() {
    let h = harness().await;
    h.sibling()
        .update_settings(&form("tcp://10.0.0.5:2375", "5", "", ""))
        .await
        .unwrap();

    let _ = h.instancer.reload_settings().await.unwrap();
    let grant = h.instancer.request(WEB, TeamId(1)).await.unwrap();

    assert_eq!(grant.expires, T0 + 5 * 60);
}

#[tokio::test]
async fn invalid_settings_form_is_not_stored() {
    let h = harness().await;

    let mut missing = form("tcp://10.0.0.5:2375", "10", "", "");
    let _ = missing.remove(KEY_MAX_CPU_CORES);
    assert!(matches!(
        h.instancer.update_settings(&missing).await.unwrap_err(),
        InstancerError::Config { .. }
    ));
    assert!(h
        .instancer
        .update_settings(&form("tcp://10.0.0.5:2375", "10", "-5", ""))
        .await
        .is_err());
    assert!(h
        .instancer
        .update_settings(&form("ftp://nowhere", "10", "", ""))
        .await
        .is_err());

    assert_eq!(h.instancer.show_settings().unwrap().expiration_minutes, 30);
}

// ── Retry ────────────────────────────────────────────────────────────

#[tokio::test]
async fn transport_failure_reconnects_once() {
    let h = harness().await;
    assert_eq!(h.connector.connects(), 1);
    h.daemon.with(|s| s.transport_failures = 1);

    let grant = h.instancer.request(WEB, TeamId(1)).await.unwrap();

    assert_eq!(grant.status, AcquireStatus::Created);
    assert_eq!(h.connector.connects(), 2);
    assert_eq!(h.daemon.runs(), 1);
}

#[tokio::test]
async fn persistent_transport_failure_surfaces_connection_error() {
    let h = harness().await;
    h.daemon.with(|s| s.transport_failures = 10);

    let err = h.instancer.request(WEB, TeamId(1)).await.unwrap_err();

    assert!(matches!(
        err,
        InstancerError::Connection {
            kind: ConnectionFailure::Transport,
            ..
        }
    ));
    assert_eq!(ErrorReply::from(&err).status, 503);
    assert_eq!(h.connector.connects(), 2);
    assert!(h.registry.list().unwrap().is_empty());
}

#[tokio::test]
async fn domain_errors_are_not_retried() {
    let h = harness().await;

    let err = h.instancer.request(BROKEN, TeamId(1)).await.unwrap_err();

    assert_eq!(err.to_string(), "image not found: missing:latest");
    assert_eq!(ErrorReply::from(&err).status, 502);
    assert_eq!(h.connector.connects(), 1);
}

#[tokio::test]
async fn custom_retry_policy_decides_what_reconnects() {
    let daemon = Arc::new(FakeDaemon::new());
    let connector = fake_connector(&daemon);
    let connection = Arc::new(ConnectionManager::new(
        Arc::clone(&connector) as Arc<dyn Connector>
    ));
    connection
        .configure(Endpoint::parse("tcp://10.0.0.5:2375").unwrap())
        .await
        .unwrap();
    let manager = LifecycleManager::new(
        connection,
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(T0)),
    )
    .with_retry_policy(RetryPolicy::new(|_| false));
    manager.set_settings(settings());
    daemon.with(|s| s.transport_failures = 1);

    let err = manager
        .acquire(&challenge(WEB, "web:latest"), TeamId(1))
        .await
        .unwrap_err();

    assert!(matches!(err, InstancerError::Transport { .. }));
    assert_eq!(connector.connects(), 1);
    assert_eq!(daemon.runs(), 0);
}

#[tokio::test]
async fn missing_connection_is_established_on_demand() {
    let h = harness_with(&settings(), Arc::new(MemoryStore::new()));
    h.connector.unreachable.store(true, Ordering::SeqCst);
    assert!(h.instancer.connect().await.is_err());

    h.connector.unreachable.store(false, Ordering::SeqCst);
    let grant = h.instancer.request(WEB, TeamId(1)).await.unwrap();

    assert_eq!(grant.status, AcquireStatus::Created);
    assert_eq!(h.connector.connects(), 2);
}

#[tokio::test]
async fn stale_generation_does_not_reconnect_twice() {
    let connector = fake_connector(&Arc::new(FakeDaemon::new()));
    let manager = ConnectionManager::new(Arc::clone(&connector) as Arc<dyn Connector>);
    manager
        .configure(Endpoint::parse("unix:///var/run/docker.sock").unwrap())
        .await
        .unwrap();
    let seen = manager.current().unwrap().generation();

    let first = manager.reconnect(Some(seen)).await.unwrap();
    let second = manager.reconnect(Some(seen)).await.unwrap();

    assert_eq!(first.generation(), second.generation());
    assert!(first.generation() > seen);
    assert_eq!(connector.connects(), 2);
}

// ── Configuration ────────────────────────────────────────────────────

#[tokio::test]
async fn disabled_backend_reports_not_configured() {
    let mut s = settings();
    s.connection_endpoint = String::new();
    let h = harness_with(&s, Arc::new(MemoryStore::new()));
    h.instancer.connect().await.unwrap();

    let err = h.instancer.request(WEB, TeamId(1)).await.unwrap_err();

    assert!(matches!(
        err,
        InstancerError::Connection {
            kind: ConnectionFailure::NotConfigured,
            ..
        }
    ));
    let status = h.instancer.connection_status().await;
    assert!(!status.configured);
    assert!(!status.connected);
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test]
async fn connection_status_reflects_endpoint() {
    let h = harness().await;
    let status = h.instancer.connection_status().await;
    assert!(status.configured);
    assert!(status.connected);
    assert_eq!(status.endpoint.as_deref(), Some("tcp://10.0.0.5:2375"));
}

#[tokio::test]
async fn limits_and_volumes_reach_the_runtime() {
    let mut s = settings();
    s.max_memory_mb = Some("256".into());
    s.max_cpu_cores = Some("0.5".into());
    let h = harness_with(&s, Arc::new(MemoryStore::new()));
    h.instancer.connect().await.unwrap();
    let mut web = challenge(WEB, "web:latest");
    web.command = "python3 app.py --port 1337".into();
    web.volumes = r#"{"/srv/flags": {"bind": "/flag", "mode": "ro"}}"#.into();
    h.instancer.register_challenge(web).unwrap();

    let _ = h.instancer.request(WEB, TeamId(1)).await.unwrap();

    let spec = h.daemon.with(|s| s.specs[0].clone());
    assert_eq!(spec.limits.memory_bytes, Some(256 * 1024 * 1024));
    assert_eq!(spec.limits.cpu_quota_us, Some(50_000));
    assert_eq!(spec.limits.cpu_period_us, Some(100_000));
    assert_eq!(spec.command, vec!["python3", "app.py", "--port", "1337"]);
    assert_eq!(spec.binds, vec!["/srv/flags:/flag:ro"]);
    assert!(spec.auto_remove);
}

#[tokio::test]
async fn malformed_limit_fails_creation() {
    let mut s = settings();
    s.max_memory_mb = Some("lots".into());
    let h = harness_with(&s, Arc::new(MemoryStore::new()));
    h.instancer.connect().await.unwrap();

    let err = h.instancer.request(WEB, TeamId(1)).await.unwrap_err();

    assert!(matches!(err, InstancerError::Config { .. }));
    assert_eq!(h.daemon.runs(), 0);
}

#[tokio::test]
async fn invalid_volume_spec_is_rejected_at_registration() {
    let h = harness().await;
    let mut web = challenge(WEB, "web:latest");
    web.volumes = "{not json".into();
    assert!(matches!(
        h.instancer.register_challenge(web).unwrap_err(),
        InstancerError::Config { .. }
    ));
}

#[tokio::test]
async fn images_are_sorted_and_deduplicated() {
    let h = harness().await;
    h.daemon.with(|s| {
        s.images = vec![
            ImageSummary {
                id: "sha256:a".into(),
                tags: vec!["web:latest".into(), "web:v1".into()],
            },
            ImageSummary {
                id: "sha256:b".into(),
                tags: vec![],
            },
            ImageSummary {
                id: "sha256:c".into(),
                tags: vec!["<none>:<none>".into()],
            },
            ImageSummary {
                id: "sha256:d".into(),
                tags: vec!["alpine:3".into(), "web:latest".into()],
            },
        ];
    });

    let list = h.instancer.list_images().await.unwrap();

    assert_eq!(list.images, vec!["alpine:3", "web:latest", "web:v1"]);
}

#[tokio::test]
async fn file_registry_is_shared_between_services() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("instances.json");
    let h = harness_with(&settings(), Arc::new(JsonFileStore::open(&path).unwrap()));
    h.instancer.connect().await.unwrap();

    let _ = h.instancer.request(WEB, TeamId(9)).await.unwrap();

    let reader = JsonFileStore::open(&path).unwrap();
    let records = reader.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].team_id, TeamId(9));
    assert_eq!(records[0].expires_at, T0 + 30 * 60);
}

// ── One service per operation ────────────────────────────────────────

/// Everything one CLI invocation shares with the next: the data directory,
/// the runtime daemon, and the wall clock.
struct Host {
    _dir: tempfile::TempDir,
    config: InstancerConfig,
    daemon: Arc<FakeDaemon>,
    connector: Arc<FakeConnector>,
    clock: Arc<ManualClock>,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = InstancerConfig::with_data_dir(dir.path());
        let daemon = Arc::new(FakeDaemon::new());
        Self {
            _dir: dir,
            config,
            connector: fake_connector(&daemon),
            daemon,
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    /// A freshly opened service over the data directory's state files.
    fn open(&self) -> Instancer {
        Instancer::new(
            Arc::clone(&self.connector) as Arc<dyn Connector>,
            Arc::new(JsonFileStore::open(&self.config.registry_file).unwrap()),
            Arc::new(JsonCatalog::open(&self.config.catalog_file).unwrap()),
            Arc::new(JsonSettingsStore::open(&self.config.settings_file).unwrap()),
            Arc::clone(&self.clock) as Arc<dyn Clock>,
        )
    }

    async fn connected(&self) -> Instancer {
        let instancer = self.open();
        instancer.connect().await.unwrap();
        instancer
    }

    fn registry(&self) -> JsonFileStore {
        JsonFileStore::open(&self.config.registry_file).unwrap()
    }
}

async fn provisioned_host() -> Host {
    let host = Host::new();
    let admin = host.open();
    admin
        .update_settings(&form("tcp://10.0.0.5:2375", "30", "", ""))
        .await
        .unwrap();
    admin.register_challenge(challenge(WEB, "web:latest")).unwrap();
    host
}

#[tokio::test]
async fn separate_invocations_share_instance_state() {
    let host = provisioned_host().await;

    let grant = host.connected().await.request(WEB, TeamId(1)).await.unwrap();
    assert_eq!(grant.status, AcquireStatus::Created);
    assert_eq!(grant.host, "ctf.example.org");
    assert_eq!(grant.expires, T0 + 30 * 60);

    host.clock.advance(600);
    let renewed = host.open().renew(WEB, TeamId(1)).await.unwrap();
    assert_eq!(renewed.expires, T0 + 600 + 30 * 60);

    let listed = host.open().list_instances().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].expires_at, renewed.expires);

    let again = host.connected().await.request(WEB, TeamId(1)).await.unwrap();
    assert_eq!(again.status, AcquireStatus::AlreadyRunning);
    assert_eq!(again.port, grant.port);
    assert_eq!(host.daemon.runs(), 1);

    let id = listed[0].container_id.clone();
    let _ = host.connected().await.stop(WEB, TeamId(1)).await.unwrap();
    assert_eq!(host.daemon.kills(), vec![id]);
    assert!(host.registry().list().unwrap().is_empty());
}

#[tokio::test]
async fn separate_sweep_reclaims_instances_from_other_invocations() {
    let host = provisioned_host().await;
    for team in 1..=2 {
        let _ = host.connected().await.request(WEB, TeamId(team)).await.unwrap();
    }

    host.clock.advance(20 * 60);
    let _ = host.open().renew(WEB, TeamId(2)).await.unwrap();
    host.clock.advance(15 * 60);

    let report = host.connected().await.manager().sweep_expired().await.unwrap();

    assert_eq!(report.reaped.len(), 1);
    let left = host.registry().list().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].team_id, TeamId(2));
}

#[tokio::test]
async fn unconnected_invocation_cannot_reach_the_runtime() {
    let host = provisioned_host().await;

    let err = host.open().request(WEB, TeamId(1)).await.unwrap_err();

    assert!(matches!(
        err,
        InstancerError::Connection {
            kind: ConnectionFailure::NotConfigured,
            ..
        }
    ));
    assert!(host.registry().list().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_invocations_keep_every_record() {
    let host = Arc::new(provisioned_host().await);

    let tasks: Vec<_> = (0..4u64)
        .map(|worker| {
            let host = Arc::clone(&host);
            tokio::spawn(async move {
                let instancer = host.connected().await;
                for n in 0..5u64 {
                    let team = TeamId(worker * 10 + n);
                    let _ = instancer.request(WEB, team).await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(host.registry().list().unwrap().len(), 20);
}
