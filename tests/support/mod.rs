// ABOUTME: Test support utilities.
// ABOUTME: Scripted fakes for the build, infrastructure, orchestration, probe and store adapters.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use halyard::backoff::BackoffPolicy;
use halyard::build::{ArtifactBuilder, BuildError, BuiltArtifact, SourceSpec};
use halyard::deploy::{
    AbortReason, AbortSignal, AddressTarget, Adapters, DeployController, DeploymentOutcome, DeploymentRequest,
    HealthPolicy, LockSettings, RunSettings, ServiceTarget, SuccessThreshold, Timeouts,
};
use halyard::infra::{ApplyOutput, DesiredState, Diff, EngineError, InfraEngine};
use halyard::orchestration::{
    OrchestrationError, OrchestrationService, RolloutHandle, ServiceStatus,
};
use halyard::probe::{Endpoint, HealthProbe, ProbeError, ProbeResponse};
use halyard::registry::MemoryRegistry;
use halyard::store::{Lease, LockStore, MemoryStore, RecordStore, StoreError};
use halyard::types::{ArtifactRef, DiffId, EnvironmentName, ServiceId, SnapshotId, VersionTag};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env().add_directive("halyard=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[allow(dead_code)]
pub fn env(name: &str) -> EnvironmentName {
    EnvironmentName::new(name).unwrap()
}

#[allow(dead_code)]
pub fn version(tag: &str) -> VersionTag {
    VersionTag::new(tag).unwrap()
}

// =============================================================================
// Builder
// =============================================================================

/// Payload depends only on the source and the current salt, like a real build.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    builds: AtomicUsize,
    salt: Mutex<String>,
}

#[allow(dead_code)]
impl FakeBuilder {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Change the content produced for every source from now on.
    pub fn change_content(&self, salt: &str) {
        *self.salt.lock() = salt.to_string();
    }
}

#[async_trait]
impl ArtifactBuilder for FakeBuilder {
    async fn build(&self, source: &SourceSpec) -> Result<BuiltArtifact, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let payload = format!("{}@{}{}", source.name, source.context.display(), self.salt.lock());
        Ok(BuiltArtifact::new(Bytes::from(payload)))
    }
}

// =============================================================================
// Infrastructure engine
// =============================================================================

#[derive(Debug)]
struct EngineState {
    serial: u64,
    outputs: BTreeMap<String, String>,
    pending: u32,
    plans: usize,
    applies: usize,
    discards: usize,
    plan_failure: Option<String>,
    /// Message, and whether the failed apply still moved the state.
    apply_failure: Option<(String, bool)>,
    /// Triggered while an apply is in flight.
    abort_on_apply: Option<AbortSignal>,
    last_variables: BTreeMap<String, String>,
}

/// Engine whose state is a serial number; each non-empty apply bumps it.
#[derive(Debug)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        let outputs = BTreeMap::from([
            ("ecs_cluster_name".to_string(), "main".to_string()),
            ("ecs_service_name".to_string(), "shop".to_string()),
            ("alb_dns_name".to_string(), "shop.elb.test".to_string()),
        ]);
        Self {
            state: Mutex::new(EngineState {
                serial: 1,
                outputs,
                pending: 1,
                plans: 0,
                applies: 0,
                discards: 0,
                plan_failure: None,
                apply_failure: None,
                abort_on_apply: None,
                last_variables: BTreeMap::new(),
            }),
        }
    }
}

fn generation(serial: u64) -> SnapshotId {
    SnapshotId::new(format!("lineage-1:{serial}"))
}

#[allow(dead_code)]
impl FakeEngine {
    pub fn serial(&self) -> u64 {
        self.state.lock().serial
    }

    pub fn applies(&self) -> usize {
        self.state.lock().applies
    }

    pub fn plans(&self) -> usize {
        self.state.lock().plans
    }

    pub fn discards(&self) -> usize {
        self.state.lock().discards
    }

    /// Next plans report an empty diff.
    pub fn no_changes(&self) {
        self.state.lock().pending = 0;
    }

    pub fn fail_plan(&self, message: &str) {
        self.state.lock().plan_failure = Some(message.to_string());
    }

    pub fn fail_apply(&self, message: &str, moved_state: bool) {
        self.state.lock().apply_failure = Some((message.to_string(), moved_state));
    }

    /// Simulate someone else applying between plan and apply.
    /// Cancel the run as if the operator pressed Ctrl-C during the next apply.
    pub fn abort_during_apply(&self, signal: AbortSignal) {
        self.state.lock().abort_on_apply = Some(signal);
    }

    pub fn bump_serial(&self) {
        self.state.lock().serial += 1;
    }

    pub fn last_variables(&self) -> BTreeMap<String, String> {
        self.state.lock().last_variables.clone()
    }
}

#[async_trait]
impl InfraEngine for FakeEngine {
    async fn check_prerequisites(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn plan(&self, desired: &DesiredState) -> Result<Diff, EngineError> {
        let mut state = self.state.lock();
        state.plans += 1;
        if let Some(message) = &state.plan_failure {
            return Err(EngineError::Plan(message.clone()));
        }
        state.last_variables = desired.variables.clone();
        Ok(Diff {
            id: DiffId::new(format!("plan-{}", state.plans)),
            environment: desired.environment.clone(),
            working_dir: desired.working_dir.clone(),
            additions: state.pending,
            changes: 0,
            deletions: 0,
            generation: generation(state.serial),
            plan_file: None,
        })
    }

    async fn current_generation(
        &self,
        _environment: &EnvironmentName,
        _working_dir: &Path,
    ) -> Result<SnapshotId, EngineError> {
        Ok(generation(self.state.lock().serial))
    }

    async fn apply(&self, diff: &Diff) -> Result<ApplyOutput, EngineError> {
        let mut state = self.state.lock();
        state.applies += 1;
        if let Some(signal) = state.abort_on_apply.take() {
            signal.trigger(AbortReason::Cancelled);
        }
        if let Some((message, moved)) = state.apply_failure.clone() {
            if moved {
                state.serial += 1;
            }
            return Err(EngineError::Apply {
                message,
                generation_after: Some(generation(state.serial)),
            });
        }
        if !diff.is_empty() {
            state.serial += 1;
            state.pending = 0;
        }
        Ok(ApplyOutput {
            generation: generation(state.serial),
            outputs: state.outputs.clone(),
        })
    }

    async fn discard(&self, _diff: &Diff) {
        self.state.lock().discards += 1;
    }
}

// =============================================================================
// Orchestration
// =============================================================================

#[derive(Debug, Default)]
struct Fleet {
    serving: Option<ArtifactRef>,
    updates: Vec<ArtifactRef>,
    polls_since_update: u32,
    degraded: HashSet<String>,
    rejected: HashSet<String>,
    stalled: HashSet<String>,
}

/// Service that converges `polls_to_converge` status polls after each update.
#[derive(Debug)]
pub struct FakeOrchestrator {
    fleet: Mutex<Fleet>,
    polls_to_converge: u32,
}

impl Default for FakeOrchestrator {
    fn default() -> Self {
        Self {
            fleet: Mutex::new(Fleet::default()),
            polls_to_converge: 2,
        }
    }
}

#[allow(dead_code)]
impl FakeOrchestrator {
    /// Start out already serving `artifact`.
    pub fn serve(&self, artifact: ArtifactRef) {
        self.fleet.lock().serving = Some(artifact);
    }

    pub fn serving(&self) -> Option<ArtifactRef> {
        self.fleet.lock().serving.clone()
    }

    /// Tags the service was pointed at, in order.
    pub fn updates(&self) -> Vec<VersionTag> {
        self.fleet
            .lock()
            .updates
            .iter()
            .map(|a| a.tag().clone())
            .collect()
    }

    /// Rollouts of `tag` trip the backend's circuit breaker.
    pub fn degrade(&self, tag: &str) {
        self.fleet.lock().degraded.insert(tag.to_string());
    }

    /// Updates to `tag` are refused outright.
    pub fn reject(&self, tag: &str) {
        self.fleet.lock().rejected.insert(tag.to_string());
    }

    /// Rollouts of `tag` never finish draining the old revision.
    pub fn stall(&self, tag: &str) {
        self.fleet.lock().stalled.insert(tag.to_string());
    }
}

#[async_trait]
impl OrchestrationService for FakeOrchestrator {
    async fn update_service(
        &self,
        service: &ServiceId,
        artifact: &ArtifactRef,
    ) -> Result<RolloutHandle, OrchestrationError> {
        let mut fleet = self.fleet.lock();
        if fleet.rejected.contains(artifact.tag().as_str()) {
            return Err(OrchestrationError::Rejected(format!(
                "{} refused",
                artifact.tag()
            )));
        }
        fleet.updates.push(artifact.clone());
        fleet.serving = Some(artifact.clone());
        fleet.polls_since_update = 0;
        Ok(RolloutHandle {
            service: service.clone(),
            artifact: artifact.clone(),
            revision: format!("td:{}", fleet.updates.len()),
            started_at: Utc::now(),
        })
    }

    async fn service_status(
        &self,
        _service: &ServiceId,
    ) -> Result<ServiceStatus, OrchestrationError> {
        let mut fleet = self.fleet.lock();
        fleet.polls_since_update += 1;
        let revision = Some(format!("td:{}", fleet.updates.len()));
        let serving = fleet.serving.as_ref().map(|a| a.tag().to_string());
        let marked = |set: &HashSet<String>| serving.as_ref().is_some_and(|t| set.contains(t));
        if marked(&fleet.degraded) {
            return Ok(ServiceStatus {
                revision,
                desired: 2,
                running: 0,
                failed: true,
                message: Some("circuit breaker tripped".to_string()),
                ..ServiceStatus::default()
            });
        }

        let converged =
            !marked(&fleet.stalled) && fleet.polls_since_update >= self.polls_to_converge;
        Ok(ServiceStatus {
            revision,
            desired: 2,
            running: 2,
            ready: if converged { 2 } else { 1 },
            draining: if converged { 0 } else { 1 },
            failed: false,
            message: None,
        })
    }
}

// =============================================================================
// Health probe
// =============================================================================

/// Answers according to what the orchestrator is currently serving.
#[derive(Debug)]
pub struct FakeProbe {
    orchestrator: Arc<FakeOrchestrator>,
    unhealthy: Mutex<HashSet<String>>,
    flaky: AtomicUsize,
    probes: AtomicUsize,
}

#[allow(dead_code)]
impl FakeProbe {
    pub fn new(orchestrator: Arc<FakeOrchestrator>) -> Self {
        Self {
            orchestrator,
            unhealthy: Mutex::new(HashSet::new()),
            flaky: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn fail_version(&self, tag: &str) {
        self.unhealthy.lock().insert(tag.to_string());
    }

    /// The next `n` probes fail regardless of version.
    pub fn fail_next(&self, n: usize) {
        self.flaky.store(n, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> Result<ProbeResponse, ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let flaky = self
            .flaky
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky {
            return Ok(ProbeResponse { status: 502 });
        }
        match self.orchestrator.serving() {
            Some(artifact) if self.unhealthy.lock().contains(artifact.tag().as_str()) => {
                Ok(ProbeResponse { status: 503 })
            }
            Some(_) => Ok(ProbeResponse { status: 200 }),
            None => Err(ProbeError::Connect("nothing is serving".to_string())),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Memory store that counts lock deletes and can be told to fail.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    releases: AtomicUsize,
    fail_release: AtomicBool,
    fail_saves: AtomicBool,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn fail_release(&self) {
        self.fail_release.store(true, Ordering::SeqCst);
    }

    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    /// Another controller takes the lock over, bypassing the release counter.
    pub async fn take_over(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(lease) = self.inner.read(key).await.unwrap() {
            self.inner.delete(key, &lease.value).await.unwrap();
        }
        assert!(self.inner.conditional_put(key, value, ttl).await.unwrap());
    }

    fn injected(&self) -> StoreError {
        StoreError::Io {
            path: PathBuf::from("/injected"),
            source: std::io::Error::other("injected failure"),
        }
    }
}

#[async_trait]
impl LockStore for CountingStore {
    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.conditional_put(key, value, ttl).await
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.refresh(key, value, ttl).await
    }

    async fn read(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        self.inner.read(key).await
    }

    async fn delete(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(self.injected());
        }
        self.inner.delete(key, value).await
    }
}

#[async_trait]
impl RecordStore for CountingStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        RecordStore::load(&self.inner, key).await
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(self.injected());
        }
        RecordStore::save(&self.inner, key, value).await
    }
}

// =============================================================================
// Harness
// =============================================================================

/// One set of fakes shared by every run of a test.
pub struct Harness {
    pub store: Arc<CountingStore>,
    pub builder: Arc<FakeBuilder>,
    pub registry: Arc<MemoryRegistry>,
    pub engine: Arc<FakeEngine>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub probe: Arc<FakeProbe>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let orchestrator = Arc::new(FakeOrchestrator::default());
        Self {
            store: Arc::new(CountingStore::default()),
            builder: Arc::new(FakeBuilder::default()),
            registry: Arc::new(MemoryRegistry::new("registry.test")),
            engine: Arc::new(FakeEngine::default()),
            probe: Arc::new(FakeProbe::new(orchestrator.clone())),
            orchestrator,
        }
    }

    pub fn controller(&self) -> DeployController {
        DeployController::new(Adapters {
            lock_store: self.store.clone(),
            record_store: self.store.clone(),
            builder: self.builder.clone(),
            registry: self.registry.clone(),
            engine: self.engine.clone(),
            orchestrator: self.orchestrator.clone(),
            probe: self.probe.clone(),
        })
    }

    pub fn settings(&self) -> RunSettings {
        RunSettings {
            region: "eu-west-1".to_string(),
            holder: "ci".to_string(),
            source: SourceSpec::new("shop", "/src/shop"),
            infrastructure_dir: PathBuf::from("/src/shop/infrastructure"),
            variables: BTreeMap::from([("instance_count".to_string(), "2".to_string())]),
            service: ServiceTarget::Outputs {
                cluster: Some("ecs_cluster_name".to_string()),
                service: "ecs_service_name".to_string(),
            },
            address: AddressTarget::Output("alb_dns_name".to_string()),
            health: HealthPolicy {
                path: "/health".to_string(),
                attempts: 3,
                success: SuccessThreshold::Consecutive(1),
                timeout: Duration::from_secs(5),
                start_period: Duration::from_secs(30),
                backoff: BackoffPolicy::constant(Duration::from_secs(10)),
            },
            lock: LockSettings {
                ttl: Duration::from_secs(3600),
                renew_interval: Duration::from_secs(600),
            },
            timeouts: Timeouts {
                run: Duration::from_secs(2700),
                rollout: Duration::from_secs(300),
                rollback: Duration::from_secs(300),
            },
            rollout_backoff: BackoffPolicy::rollout_default(),
        }
    }

    pub fn request(&self, environment: &str, tag: &str) -> DeploymentRequest {
        DeploymentRequest::builder(env(environment), version(tag))
            .registry(Some("registry.test".to_string()))
            .build()
    }

    pub async fn deploy(&self, environment: &str, tag: &str) -> DeploymentOutcome {
        self.controller()
            .run(self.request(environment, tag), self.settings(), AbortSignal::new())
            .await
    }
}
