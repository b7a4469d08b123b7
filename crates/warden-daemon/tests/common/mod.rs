//! Mock collaborators and a fully wired service graph for the daemon tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use warden_core::config::Config;
use warden_core::providers::{
    CleanupStep, ConfigPolicy, CredentialPool, IntegrityReport, IntegrityStatus, PoolStats,
    ProcessReport, ProviderError, ServiceHost, StaticSystemStatus,
};
use warden_core::types::Credential;
use warden_harness::circuit_breaker::CircuitBreakerRegistry;
use warden_harness::scheduler::TaskScheduler;
use warden_telemetry::metrics::MetricsCollector;

use warden_daemon::authority::ExecutionAuthority;
use warden_daemon::detection::DetectionEngine;
use warden_daemon::healing::SelfHealingOrchestrator;

// ===========================================================================
// Credential pool
// ===========================================================================

#[derive(Debug, Default)]
struct PoolState {
    total: usize,
    active: usize,
    rotations: u32,
    successes: u32,
    failures: Vec<String>,
}

/// Pool whose size and active count are set directly by the test.
#[derive(Debug, Default)]
pub struct MockPool {
    state: Mutex<PoolState>,
}

impl MockPool {
    pub fn with_keys(total: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                total,
                active: total,
                ..PoolState::default()
            }),
        }
    }

    pub fn empty() -> Self {
        Self::with_keys(0)
    }

    pub fn set_active(&self, active: usize) {
        self.state.lock().unwrap().active = active;
    }

    pub fn rotations(&self) -> u32 {
        self.state.lock().unwrap().rotations
    }

    pub fn successes(&self) -> u32 {
        self.state.lock().unwrap().successes
    }

    pub fn failures(&self) -> Vec<String> {
        self.state.lock().unwrap().failures.clone()
    }
}

#[async_trait]
impl CredentialPool for MockPool {
    async fn current_key(&self) -> Option<Credential> {
        let state = self.state.lock().unwrap();
        (state.active > 0).then(|| Credential::new("key-1", "sk-test-1"))
    }

    async fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            total: state.total,
            active: state.active,
            exhausted: state.total - state.active,
            current: (state.active > 0).then(|| "key-1".to_string()),
        }
    }

    async fn rotate(&self) -> Option<Credential> {
        let mut state = self.state.lock().unwrap();
        if state.active == 0 {
            return None;
        }
        state.rotations += 1;
        let slot = state.rotations as usize % state.total.max(1) + 1;
        Some(Credential::new(format!("key-{slot}"), "sk"))
    }

    async fn record_success(&self, _key: &Credential) {
        self.state.lock().unwrap().successes += 1;
    }

    async fn record_failure(&self, _key: &Credential, error: &str) {
        self.state.lock().unwrap().failures.push(error.to_string());
    }
}

// ===========================================================================
// Service host
// ===========================================================================

#[derive(Debug)]
struct HostState {
    port_conflict: bool,
    stale_processes: usize,
    integrity: IntegrityStatus,
    restart_fails: bool,
    cleanup_fails: bool,
    probe_fails: bool,
    restarts: u32,
    cleanup_steps: Vec<CleanupStep>,
}

/// Host whose process and integrity state are scripted by the test.
#[derive(Debug)]
pub struct MockHost {
    state: Mutex<HostState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::healthy()
    }
}

impl MockHost {
    pub fn healthy() -> Self {
        Self {
            state: Mutex::new(HostState {
                port_conflict: false,
                stale_processes: 0,
                integrity: IntegrityStatus::Healthy,
                restart_fails: false,
                cleanup_fails: false,
                probe_fails: false,
                restarts: 0,
                cleanup_steps: Vec::new(),
            }),
        }
    }

    pub fn set_port_conflict(&self, conflict: bool) {
        self.state.lock().unwrap().port_conflict = conflict;
    }

    pub fn set_stale_processes(&self, count: usize) {
        self.state.lock().unwrap().stale_processes = count;
    }

    pub fn set_integrity(&self, status: IntegrityStatus) {
        self.state.lock().unwrap().integrity = status;
    }

    pub fn set_restart_fails(&self, fails: bool) {
        self.state.lock().unwrap().restart_fails = fails;
    }

    pub fn set_cleanup_fails(&self, fails: bool) {
        self.state.lock().unwrap().cleanup_fails = fails;
    }

    pub fn set_probe_fails(&self, fails: bool) {
        self.state.lock().unwrap().probe_fails = fails;
    }

    pub fn restarts(&self) -> u32 {
        self.state.lock().unwrap().restarts
    }

    pub fn cleanup_steps(&self) -> Vec<CleanupStep> {
        self.state.lock().unwrap().cleanup_steps.clone()
    }
}

#[async_trait]
impl ServiceHost for MockHost {
    async fn probe_process(&self) -> Result<ProcessReport, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.probe_fails {
            return Err(ProviderError::Unavailable("probe offline".into()));
        }
        Ok(ProcessReport {
            port: 9095,
            port_conflict: state.port_conflict,
            stale_processes: state.stale_processes,
            details: format!(
                "conflict={} stale={}",
                state.port_conflict, state.stale_processes
            ),
        })
    }

    async fn cleanup_step(&self, step: CleanupStep) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.cleanup_steps.push(step);
        if state.cleanup_fails {
            return Err(ProviderError::Failed(format!("{step:?} refused")));
        }
        match step {
            CleanupStep::ReapStaleProcesses => state.stale_processes = 0,
            CleanupStep::ReleasePort => state.port_conflict = false,
            CleanupStep::ClearLocks => {}
        }
        Ok(format!("{step:?} done"))
    }

    async fn restart(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.restarts += 1;
        if state.restart_fails {
            return Err(ProviderError::Failed("service refused to restart".into()));
        }
        if state.integrity == IntegrityStatus::NotLoaded {
            state.integrity = IntegrityStatus::Healthy;
        }
        Ok(())
    }

    async fn check_integrity(&self) -> Result<IntegrityReport, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(IntegrityReport {
            status: state.integrity,
            message: format!("integrity {:?}", state.integrity),
        })
    }
}

// ===========================================================================
// Wiring
// ===========================================================================

/// Config with fast healing backoff and a small dormant ceiling.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.healing.base_backoff_ms = 10;
    config.healing.max_backoff_ms = 80;
    config.detection.min_decisions_for_ratio = 4;
    config
}

pub struct Fixture {
    pub config: Config,
    pub pool: Arc<MockPool>,
    pub status: Arc<StaticSystemStatus>,
    pub host: Arc<MockHost>,
    pub metrics: Arc<MetricsCollector>,
    pub scheduler: Arc<TaskScheduler>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub authority: Arc<ExecutionAuthority>,
    pub detection: Arc<DetectionEngine>,
    pub healing: Arc<SelfHealingOrchestrator>,
}

pub fn fixture(config: Config, pool: MockPool, host: MockHost) -> Fixture {
    let pool = Arc::new(pool);
    let host = Arc::new(host);
    let status = Arc::new(StaticSystemStatus::serving());
    let metrics = Arc::new(MetricsCollector::new());
    let scheduler = Arc::new(TaskScheduler::new(&config.scheduler));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));

    let authority = Arc::new(
        ExecutionAuthority::new(
            config.authority.clone(),
            pool.clone(),
            status.clone(),
            Arc::new(ConfigPolicy::from_config(&config.service)),
        )
        .with_metrics(metrics.clone()),
    );
    let detection = Arc::new(
        DetectionEngine::new(
            config.detection.clone(),
            pool.clone(),
            status.clone(),
            authority.clone(),
            host.clone(),
            scheduler.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    let healing = SelfHealingOrchestrator::new(
        config.healing.clone(),
        detection.clone(),
        pool.clone(),
        host.clone(),
        scheduler.clone(),
        breakers.clone(),
        Some(metrics.clone()),
    );

    Fixture {
        config,
        pool,
        status,
        host,
        metrics,
        scheduler,
        breakers,
        authority,
        detection,
        healing,
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
