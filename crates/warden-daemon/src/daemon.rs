use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use warden_core::config::Config;
use warden_core::providers::{
    ConfigPolicy, CredentialPool, EnvCredentialPool, EnvironmentPolicy, ServiceHost,
    StaticSystemStatus, SystemStatusProvider,
};
use warden_core::types::SystemHealthSnapshot;
use warden_harness::circuit_breaker::{CircuitBreakerRegistry, CircuitState, CircuitStatus};
use warden_harness::scheduler::{task_handler, RegisterOptions, SchedulerStats, TaskScheduler};
use warden_harness::shutdown::ShutdownCoordinator;
use warden_telemetry::metrics::{names, MetricsCollector};

use crate::authority::{AuthorityStats, ExecutionAuthority, GuardedExecutor};
use crate::detection::DetectionEngine;
use crate::healing::{HealingStats, SelfHealingOrchestrator};
use crate::host::LocalServiceHost;

pub const METRICS_TASK_ID: &str = "daemon:metrics-refresh";
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// The external systems the reliability core consults.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialPool>,
    pub status: Arc<dyn SystemStatusProvider>,
    pub policy: Arc<dyn EnvironmentPolicy>,
    pub host: Arc<dyn ServiceHost>,
}

impl Collaborators {
    /// The reference implementations: keys from the environment, a status
    /// that always serves, policy from the service section, local port probe.
    pub fn from_config(config: &Config) -> Self {
        Self {
            credentials: Arc::new(EnvCredentialPool::from_env(&config.credentials)),
            status: Arc::new(StaticSystemStatus::serving()),
            policy: Arc::new(ConfigPolicy::from_config(&config.service)),
            host: Arc::new(LocalServiceHost::from_config(&config.service)),
        }
    }
}

/// Everything an operator needs in one serializable view.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub health: Option<SystemHealthSnapshot>,
    pub healing: HealingStats,
    pub authority: AuthorityStats,
    pub scheduler: SchedulerStats,
    pub breakers: Vec<CircuitStatus>,
}

/// Owns every reliability service and wires them together.
///
/// Each service is constructed once and shared by `Arc`; detection alerts
/// feed the healing orchestrator, and the shutdown coordinator releases
/// every scheduled task on exit.
pub struct Daemon {
    config: Config,
    metrics: Arc<MetricsCollector>,
    scheduler: Arc<TaskScheduler>,
    breakers: Arc<CircuitBreakerRegistry>,
    authority: Arc<ExecutionAuthority>,
    executor: GuardedExecutor,
    detection: Arc<DetectionEngine>,
    healing: Arc<SelfHealingOrchestrator>,
    shutdown: ShutdownCoordinator,
}

impl Daemon {
    /// Build the daemon with the reference collaborators.
    pub fn new(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate().context("invalid warden configuration")?;

        let metrics = Arc::new(MetricsCollector::new());
        let scheduler = Arc::new(TaskScheduler::new(&config.scheduler));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));

        let authority = Arc::new(
            ExecutionAuthority::new(
                config.authority.clone(),
                collaborators.credentials.clone(),
                collaborators.status.clone(),
                collaborators.policy.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let executor = GuardedExecutor::new(authority.clone());

        let detection = Arc::new(
            DetectionEngine::new(
                config.detection.clone(),
                collaborators.credentials.clone(),
                collaborators.status.clone(),
                authority.clone(),
                collaborators.host.clone(),
                scheduler.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        let healing = SelfHealingOrchestrator::new(
            config.healing.clone(),
            detection.clone(),
            collaborators.credentials,
            collaborators.host,
            scheduler.clone(),
            breakers.clone(),
            Some(metrics.clone()),
        );

        let shutdown = ShutdownCoordinator::new(scheduler.clone());

        Ok(Self {
            config,
            metrics,
            scheduler,
            breakers,
            authority,
            executor,
            detection,
            healing,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn authority(&self) -> &Arc<ExecutionAuthority> {
        &self.authority
    }

    /// The decorator every protected call site goes through.
    pub fn executor(&self) -> &GuardedExecutor {
        &self.executor
    }

    pub fn detection(&self) -> &Arc<DetectionEngine> {
        &self.detection
    }

    pub fn healing(&self) -> &Arc<SelfHealingOrchestrator> {
        &self.healing
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Start monitoring, healing, and the metrics refresh task.
    pub fn start(&self) {
        let monitoring = if self.config.detection.monitoring_enabled {
            self.detection.start_monitoring()
        } else {
            info!("health monitoring disabled by configuration");
            false
        };
        let healing = self.healing.start();

        let scheduler = Arc::downgrade(&self.scheduler);
        let breakers = Arc::downgrade(&self.breakers);
        let metrics = Arc::downgrade(&self.metrics);
        self.scheduler.register_interval(
            METRICS_TASK_ID,
            task_handler(move || {
                let (scheduler, breakers, metrics) =
                    (scheduler.upgrade(), breakers.upgrade(), metrics.upgrade());
                async move {
                    if let (Some(scheduler), Some(breakers), Some(metrics)) =
                        (scheduler, breakers, metrics)
                    {
                        refresh_gauges(&scheduler, &breakers, &metrics).await;
                    }
                    Ok(())
                }
            }),
            METRICS_REFRESH_INTERVAL,
            RegisterOptions::replacing(),
        );

        info!(
            monitoring,
            healing,
            tasks = self.scheduler.len(),
            "warden daemon started"
        );
    }

    /// Start, then block until Ctrl-C / SIGTERM and shut down.
    pub async fn run(&self) -> Result<()> {
        let _cleanup = self.shutdown.guard();
        self.start();
        self.shutdown.run_until_signal().await;
        self.stop();
        Ok(())
    }

    /// Stop every background task. Idempotent.
    pub fn stop(&self) {
        self.detection.stop_monitoring();
        self.healing.stop_automatic_healing();
        let released = self.shutdown.trigger("daemon_stop");
        info!(released, "warden daemon stopped");
    }

    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            health: self.detection.last_snapshot(),
            healing: self.healing.get_healing_stats().await,
            authority: self.authority.stats(),
            scheduler: self.scheduler.stats(),
            breakers: self.breakers.get_status().await,
        }
    }

    /// Prometheus text for every warden metric, gauges refreshed first.
    pub async fn render_metrics(&self) -> String {
        refresh_gauges(&self.scheduler, &self.breakers, &self.metrics).await;
        self.metrics.export_prometheus()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if !self.shutdown.is_shutting_down() {
            warn!("daemon dropped without stop(); releasing scheduled tasks");
            self.shutdown.trigger("daemon_dropped");
        }
    }
}

fn circuit_state_code(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
        CircuitState::PermanentOpen => 3,
    }
}

async fn refresh_gauges(
    scheduler: &TaskScheduler,
    breakers: &CircuitBreakerRegistry,
    metrics: &MetricsCollector,
) {
    metrics.set_gauge(names::SCHEDULED_TASKS, &[], scheduler.len() as i64);
    for status in breakers.get_status().await {
        metrics.set_gauge(
            names::CIRCUIT_STATE,
            &[("breaker", status.name.as_str())],
            circuit_state_code(status.state),
        );
    }
}
