//! Periodic health scheduler.
//!
//! One timer-driven loop per process. Each tick snapshots the registry and
//! probes every credential with bounded fan-out. Stopping prevents the next
//! tick; a tick already dispatching runs to completion.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{HealthMonitor, MonitorError};
use crate::vault::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Dispatching,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Dispatching => "dispatching",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between ticks. The first tick fires one interval after start.
    pub interval: Duration,
    /// Upper bound on probes in flight within one tick.
    pub max_concurrency: usize,
    /// Each probe is delayed by a random amount up to this.
    pub dispatch_jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_concurrency: 8,
            dispatch_jitter: Duration::ZERO,
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub total: usize,
    pub ok: usize,
    pub expired: usize,
    pub rate_limited: usize,
    pub errors: usize,
    /// Outcomes that could not be recorded, plus panicked probe tasks.
    pub failed: usize,
    /// Credentials removed between the snapshot and their probe.
    pub skipped: usize,
    pub duration_ms: u64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TickReport {
    fn count(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Ok => self.ok += 1,
            HealthStatus::Expired => self.expired += 1,
            HealthStatus::RateLimited => self.rate_limited += 1,
            HealthStatus::Error => self.errors += 1,
        }
    }
}

pub struct Scheduler {
    monitor: Arc<HealthMonitor>,
    config: SchedulerConfig,
    state: Arc<RwLock<SchedulerState>>,
    last_tick: Arc<RwLock<Option<TickReport>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(monitor: Arc<HealthMonitor>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            monitor,
            config,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            last_tick: Arc::new(RwLock::new(None)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        *read(&self.state)
    }

    pub fn last_tick(&self) -> Option<TickReport> {
        read(&self.last_tick).clone()
    }

    /// Spawn the periodic loop. Only valid once, from `Idle`.
    pub fn start(&self) -> Result<()> {
        if self.config.interval.is_zero() {
            bail!("scheduler interval must be greater than zero");
        }
        {
            let mut state = write(&self.state);
            if *state != SchedulerState::Idle {
                bail!("scheduler cannot start from state '{}'", *state);
            }
            *state = SchedulerState::Running;
        }

        let monitor = Arc::clone(&self.monitor);
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let last_tick = Arc::clone(&self.last_tick);
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() || !transition(&state, SchedulerState::Running, SchedulerState::Dispatching) {
                    break;
                }

                match run_tick(&monitor, &config).await {
                    Ok(report) => {
                        *write(&last_tick) = Some(report);
                    }
                    // Registry unavailable: nothing recorded, retry next tick.
                    Err(e) => error!("Scheduled tick failed: {}", e),
                }

                transition(&state, SchedulerState::Dispatching, SchedulerState::Running);
            }
            debug!("Scheduler loop exited");
        });
        *lock(&self.task) = Some(handle);

        info!(
            interval_secs = self.config.interval.as_secs(),
            max_concurrency = self.config.max_concurrency,
            "⏱️ Health scheduler started"
        );
        Ok(())
    }

    /// Prevent further ticks. Safe to call any number of times.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *write(&self.state), SchedulerState::Stopped);
        self.shutdown.send_replace(true);
        if previous != SchedulerState::Stopped {
            info!(previous = %previous, "Health scheduler stopped");
        }
    }

    /// Stop, then wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }
    }
}

/// Probe every registered credential once.
///
/// Fails only when the registry cannot be read. Per-credential problems are
/// counted in the report and never abort the other probes.
pub async fn run_tick(monitor: &Arc<HealthMonitor>, config: &SchedulerConfig) -> Result<TickReport, MonitorError> {
    let started = Instant::now();
    let credentials = monitor.list()?;
    let mut report = TickReport {
        total: credentials.len(),
        ..TickReport::default()
    };

    info!(keys = credentials.len(), "📡 Running scheduled health check...");

    let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for credential in credentials {
        let monitor = Arc::clone(monitor);
        let permits = Arc::clone(&permits);
        let delay = jitter(config.dispatch_jitter);

        tasks.spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            let _permit = permits.acquire_owned().await.ok()?;
            Some((credential.id.clone(), monitor.check(&credential).await))
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some((_, Ok(outcome)))) => report.count(outcome.status),
            Ok(Some((key_id, Err(MonitorError::NotFound(_))))) => {
                debug!(key_id = %key_id, "Key removed mid-tick, skipped");
                report.skipped += 1;
            }
            Ok(Some((key_id, Err(e)))) => {
                error!(key_id = %key_id, "Failed to record health check: {}", e);
                report.failed += 1;
            }
            Ok(None) => report.skipped += 1,
            Err(e) => {
                error!("Probe task panicked: {}", e);
                report.failed += 1;
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    report.finished_at = Some(Utc::now());

    if report.failed > 0 {
        warn!(failed = report.failed, "Some health checks were not recorded");
    }
    info!(
        total = report.total,
        ok = report.ok,
        expired = report.expired,
        rate_limited = report.rate_limited,
        errors = report.errors,
        skipped = report.skipped,
        duration_ms = report.duration_ms,
        "📡 Health check tick complete"
    );

    Ok(report)
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Move `from → to`; a no-op returning false from any other state, so a
/// stopped scheduler never leaves `Stopped`.
fn transition(state: &RwLock<SchedulerState>, from: SchedulerState, to: SchedulerState) -> bool {
    let mut current = write(state);
    if *current != from {
        return false;
    }
    *current = to;
    true
}

// Poisoning only means a holder panicked; the guarded values stay valid.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tests::closed_port_url;
    use crate::adapters::{
        join_url, AdapterRegistry, ProbeAdapter, ProbeConfigError, ProbeReport, ProbeRequest, RawResult,
        ServiceKind, SuccessCriterion,
    };
    use crate::monitor::tests::{open_monitor, openai_key, openai_stub};
    use crate::vault::store::KeyStore;
    use crate::vault::{
        Credential, CredentialRegistry, HistoryStore, Metadata, NewCredential, Secret, StoreError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(interval: Duration, max_concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            interval,
            max_concurrency,
            dispatch_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_tick_isolates_a_failing_probe() {
        let dir = TempDir::new().unwrap();
        let (monitor, store) = open_monitor(&dir);
        let stub = openai_stub().await;
        let base = format!("{}/v1", stub.uri());

        for i in 0..49 {
            store.add(openai_key(&format!("key-{}", i), "valid", &base)).unwrap();
        }
        let broken = store.add(openai_key("broken", "valid", &closed_port_url())).unwrap();

        let report = run_tick(&monitor, &config(Duration::from_secs(300), 8)).await.unwrap();

        assert_eq!(report.total, 50);
        assert_eq!(report.ok, 49);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed, 0);
        for credential in store.list().unwrap() {
            let history = store.list_for(&credential.id, None).unwrap();
            assert_eq!(history.len(), 1, "exactly one outcome for {}", credential.name);
        }
        let broken_history = store.list_for(&broken.id, None).unwrap();
        assert_eq!(broken_history[0].status, HealthStatus::Error);
    }

    struct SlowProbe {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowProbe {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProbeAdapter for SlowProbe {
        fn kind(&self) -> ServiceKind { ServiceKind::Custom }
        fn display_name(&self) -> &str { "slow" }

        fn prepare(&self, _credential: &Credential) -> Result<ProbeRequest, ProbeConfigError> {
            Ok(ProbeRequest::get(join_url("http://localhost", "slow")?))
        }

        async fn probe(&self, _client: &reqwest::Client, _credential: &Credential) -> ProbeReport {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ProbeReport {
                raw: RawResult {
                    succeeded: true,
                    http_status: Some(200),
                    body_or_error: String::new(),
                    elapsed_ms: self.delay.as_secs_f64() * 1000.0,
                },
                criterion: SuccessCriterion::Standard,
            }
        }
    }

    fn slow_monitor(dir: &TempDir, delay: Duration, keys: usize) -> (Arc<HealthMonitor>, Arc<KeyStore>, Arc<SlowProbe>) {
        let store = Arc::new(KeyStore::open(&dir.path().join("keywatch.db"), b"test-master").unwrap());
        let probe = Arc::new(SlowProbe::new(delay));
        let mut adapters = AdapterRegistry::new(reqwest::Client::new());
        adapters.register(probe.clone());
        let monitor = Arc::new(HealthMonitor::new(store.clone(), store.clone(), Arc::new(adapters)));

        for i in 0..keys {
            store
                .add(NewCredential {
                    service: ServiceKind::Custom,
                    name: format!("custom-{}", i),
                    secret: Secret::new("k"),
                    metadata: Metadata::new(),
                })
                .unwrap();
        }
        (monitor, store, probe)
    }

    #[tokio::test]
    async fn test_tick_respects_concurrency_bound() {
        let dir = TempDir::new().unwrap();
        let (monitor, _store, probe) = slow_monitor(&dir, Duration::from_millis(20), 20);

        let report = run_tick(&monitor, &config(Duration::from_secs(300), 3)).await.unwrap();
        assert_eq!(report.ok, 20);
        let peak = probe.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {}", peak);
        assert!(peak >= 1);
    }

    struct UnavailableRegistry;

    impl CredentialRegistry for UnavailableRegistry {
        fn list(&self) -> Result<Vec<Credential>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn get(&self, id: &str) -> Result<Credential, StoreError> {
            Err(StoreError::NotFound(id.into()))
        }
        fn add(&self, _new: NewCredential) -> Result<Credential, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn remove(&self, id: &str) -> Result<Credential, StoreError> {
            Err(StoreError::NotFound(id.into()))
        }
    }

    #[tokio::test]
    async fn test_registry_failure_fails_the_tick() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open(&dir.path().join("keywatch.db"), b"test-master").unwrap());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::new(UnavailableRegistry),
            store,
            Arc::new(AdapterRegistry::new(reqwest::Client::new())),
        ));

        let result = run_tick(&monitor, &SchedulerConfig::default()).await;
        assert!(matches!(result, Err(MonitorError::Store(StoreError::Poisoned))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);
        let scheduler = Scheduler::new(monitor, config(Duration::from_secs(3600), 2));

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(scheduler.start().is_err());

        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.start().is_err());
    }

    #[tokio::test]
    async fn test_stop_mid_tick_lets_checks_finish() {
        let dir = TempDir::new().unwrap();
        let (monitor, store, slow) = slow_monitor(&dir, Duration::from_millis(400), 5);

        let scheduler = Scheduler::new(monitor, config(Duration::from_millis(100), 5));
        scheduler.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.state() != SchedulerState::Dispatching {
            assert!(Instant::now() < deadline, "tick never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(slow.in_flight.load(Ordering::SeqCst), 0);
        for credential in store.list().unwrap() {
            assert_eq!(store.list_for(&credential.id, None).unwrap().len(), 1, "{}", credential.name);
        }
        assert_eq!(scheduler.last_tick().unwrap().ok, 5);

        // Several intervals later: no further tick was dispatched.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        for credential in store.list().unwrap() {
            assert_eq!(store.list_for(&credential.id, None).unwrap().len(), 1, "{}", credential.name);
        }
    }

    #[tokio::test]
    async fn test_no_tick_at_start() {
        let dir = TempDir::new().unwrap();
        let (monitor, store) = open_monitor(&dir);
        let stub = openai_stub().await;
        let key = store.add(openai_key("prod", "valid", &format!("{}/v1", stub.uri()))).unwrap();

        let scheduler = Scheduler::new(monitor, config(Duration::from_secs(3600), 2));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown().await;

        assert!(store.list_for(&key.id, None).unwrap().is_empty());
        assert!(scheduler.last_tick().is_none());
    }

    #[tokio::test]
    async fn test_ticks_repeat_on_interval() {
        let dir = TempDir::new().unwrap();
        let (monitor, store) = open_monitor(&dir);
        let stub = openai_stub().await;
        let key = store.add(openai_key("prod", "valid", &format!("{}/v1", stub.uri()))).unwrap();

        let scheduler = Scheduler::new(monitor, config(Duration::from_millis(50), 2));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        scheduler.shutdown().await;

        let history = store.list_for(&key.id, None).unwrap();
        assert!(history.len() >= 2, "expected repeated ticks, got {}", history.len());
        assert!(history.iter().all(|o| o.status == HealthStatus::Ok));
        assert_eq!(scheduler.last_tick().unwrap().total, 1);

        // Nothing further after shutdown.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.list_for(&key.id, None).unwrap().len(), history.len());
    }

    #[test]
    fn test_jitter_is_bounded() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(25)) <= Duration::from_millis(25));
        }
    }
}
