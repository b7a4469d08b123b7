use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use warden_core::config::DetectionConfig;
use warden_core::providers::{CredentialPool, IntegrityStatus, ProviderError, ServiceHost, SystemStatusProvider};
use warden_core::types::{
    DetectionFinding, FindingCategory, FindingCode, OverallHealth, Severity, SystemHealthSnapshot,
};
use warden_harness::scheduler::{task_handler, RegisterOptions, TaskScheduler};
use warden_telemetry::metrics::{names, MetricsCollector};

use crate::authority::ExecutionAuthority;

/// Scheduler id of the recurring health check.
pub const MONITOR_TASK_ID: &str = "health-detection:monitor";

/// Denial ratio above which the authority check warns.
const DENIAL_RATIO_WARNING: f64 = 0.5;

/// Stale processes at which process health becomes critical.
const STALE_PROCESS_CRITICAL: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetectionError {
    #[error("unknown detection category `{0}`")]
    UnknownCategory(String),
}

/// Invoked synchronously for every critical or emergency finding.
pub type AlertCallback = Arc<dyn Fn(&DetectionFinding) + Send + Sync>;

/// Roll findings up into one overall health value.
///
/// Emergency if any finding is an emergency, else Critical if any is
/// critical, else Degraded above two warnings, else Healthy. Passing
/// findings never count.
pub fn aggregate(findings: &[DetectionFinding]) -> OverallHealth {
    let failing = || findings.iter().filter(|f| !f.passed);
    if failing().any(|f| f.severity == Severity::Emergency) {
        OverallHealth::Emergency
    } else if failing().any(|f| f.severity == Severity::Critical) {
        OverallHealth::Critical
    } else if failing().filter(|f| f.severity == Severity::Warning).count() > 2 {
        OverallHealth::Degraded
    } else {
        OverallHealth::Healthy
    }
}

/// Deduplicated advice for every failing category, in finding order.
fn recommendations(findings: &[DetectionFinding]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for finding in findings.iter().filter(|f| !f.passed && f.severity >= Severity::Warning) {
        let advice = finding.category.recommendation();
        if !out.iter().any(|r| r == advice) {
            out.push(advice.to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// DetectionEngine
// ---------------------------------------------------------------------------

pub struct DetectionEngine {
    config: DetectionConfig,
    credentials: Arc<dyn CredentialPool>,
    status: Arc<dyn SystemStatusProvider>,
    authority: Arc<ExecutionAuthority>,
    host: Arc<dyn ServiceHost>,
    scheduler: Arc<TaskScheduler>,
    metrics: Option<Arc<MetricsCollector>>,
    history: Mutex<VecDeque<DetectionFinding>>,
    callbacks: Mutex<Vec<AlertCallback>>,
    last_snapshot: Mutex<Option<SystemHealthSnapshot>>,
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("monitoring", &self.is_monitoring())
            .field("findings", &self.findings_len())
            .finish_non_exhaustive()
    }
}

impl DetectionEngine {
    pub fn new(
        config: DetectionConfig,
        credentials: Arc<dyn CredentialPool>,
        status: Arc<dyn SystemStatusProvider>,
        authority: Arc<ExecutionAuthority>,
        host: Arc<dyn ServiceHost>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            config,
            credentials,
            status,
            authority,
            host,
            scheduler,
            metrics: None,
            history: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // -- checks -------------------------------------------------------------

    /// Run every check concurrently and aggregate the result.
    pub async fn perform_full_health_check(&self) -> SystemHealthSnapshot {
        let (credentials, authority, bypass, mock, process, integrity) = futures::join!(
            self.run_check(FindingCategory::CredentialPool),
            self.run_check(FindingCategory::Authority),
            self.run_check(FindingCategory::BypassAttempts),
            self.run_check(FindingCategory::MockUsage),
            self.run_check(FindingCategory::ProcessHealth),
            self.run_check(FindingCategory::Integrity),
        );
        let findings: Vec<DetectionFinding> = [credentials, authority, bypass, mock, process, integrity]
            .into_iter()
            .flatten()
            .collect();

        let overall = aggregate(&findings);
        let failing = findings.iter().filter(|f| !f.passed).count();
        let snapshot = SystemHealthSnapshot {
            overall,
            summary: format!(
                "{} findings, {} failing ({} emergency, {} critical, {} warning)",
                findings.len(),
                failing,
                count(&findings, Severity::Emergency),
                count(&findings, Severity::Critical),
                count(&findings, Severity::Warning),
            ),
            recommendations: recommendations(&findings),
            findings,
            timestamp: Utc::now(),
        };

        match overall {
            OverallHealth::Healthy => debug!(summary = %snapshot.summary, "health check passed"),
            OverallHealth::Degraded => warn!(summary = %snapshot.summary, "system degraded"),
            OverallHealth::Critical | OverallHealth::Emergency => {
                warn!(overall = ?overall, summary = %snapshot.summary, "system unhealthy")
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(names::HEALTH_CHECKS, &[("overall", overall.as_str())]);
        }

        self.append_history(&snapshot.findings);
        *self.last_snapshot.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot.clone());
        self.dispatch_alerts(&snapshot.findings);
        snapshot
    }

    /// Re-run a single check by category name (`credential_pool`,
    /// `mock-usage`, ...).
    pub async fn check_category(&self, name: &str) -> Result<Vec<DetectionFinding>, DetectionError> {
        let category: FindingCategory = name
            .parse()
            .map_err(|_| DetectionError::UnknownCategory(name.to_string()))?;
        let findings = self.run_check(category).await;
        self.append_history(&findings);
        self.dispatch_alerts(&findings);
        Ok(findings)
    }

    /// Run one check; a collaborator error becomes a warning finding.
    async fn run_check(&self, category: FindingCategory) -> Vec<DetectionFinding> {
        let result = match category {
            FindingCategory::CredentialPool => self.check_credentials().await,
            FindingCategory::Authority => self.check_authority().await,
            FindingCategory::BypassAttempts => Ok(self.check_bypass()),
            FindingCategory::MockUsage => Ok(self.check_mock_usage()),
            FindingCategory::ProcessHealth => self.check_process().await,
            FindingCategory::Integrity => self.check_integrity().await,
        };
        result.unwrap_or_else(|e| {
            warn!(category = %category, error = %e, "health check failed to run");
            vec![DetectionFinding::failed(
                category,
                FindingCode::CheckFailed,
                Severity::Warning,
                format!("{category} check failed: {e}"),
            )]
        })
    }

    async fn check_credentials(&self) -> Result<Vec<DetectionFinding>, ProviderError> {
        let stats = self.credentials.stats().await;
        let finding = if stats.active == 0 {
            DetectionFinding::failed(
                FindingCategory::CredentialPool,
                FindingCode::CredentialsExhausted,
                Severity::Emergency,
                format!(
                    "no active API credentials ({} configured, {} exhausted)",
                    stats.total, stats.exhausted
                ),
            )
            .with_action("configure at least one valid API credential")
        } else if stats.active == 1 && stats.total > 1 {
            DetectionFinding::failed(
                FindingCategory::CredentialPool,
                FindingCode::CredentialsLow,
                Severity::Warning,
                format!("only 1 of {} API credentials is active", stats.total),
            )
        } else {
            DetectionFinding::ok(
                FindingCategory::CredentialPool,
                format!("{} of {} API credentials active", stats.active, stats.total),
            )
        };
        Ok(vec![finding])
    }

    async fn check_authority(&self) -> Result<Vec<DetectionFinding>, ProviderError> {
        let status = self.status.status().await?;
        let mut findings = Vec::new();
        if !status.can_serve_requests {
            findings.push(
                DetectionFinding::failed(
                    FindingCategory::Authority,
                    FindingCode::AuthorityUnavailable,
                    Severity::Critical,
                    format!("system cannot serve requests: {}", status.message),
                )
                .with_action("restart the protected service"),
            );
        }

        let stats = self.authority.stats();
        if stats.total >= self.config.min_decisions_for_ratio
            && stats.denial_ratio() > DENIAL_RATIO_WARNING
        {
            findings.push(DetectionFinding::failed(
                FindingCategory::Authority,
                FindingCode::AuthorityDenials,
                Severity::Warning,
                format!(
                    "{} of {} authorization decisions were denials",
                    stats.denied, stats.total
                ),
            ));
        }

        if findings.is_empty() {
            findings.push(DetectionFinding::ok(
                FindingCategory::Authority,
                format!("authority serving ({} decisions)", stats.total),
            ));
        }
        Ok(findings)
    }

    fn check_bypass(&self) -> Vec<DetectionFinding> {
        let attempts = self.authority.stats().bypass_attempts;
        let finding = if attempts >= self.config.bypass_critical_threshold {
            DetectionFinding::failed(
                FindingCategory::BypassAttempts,
                FindingCode::BypassDetected,
                Severity::Critical,
                format!("{attempts} authority bypass attempts recorded"),
            )
            .with_action("audit callers of protected operations")
        } else if attempts > 0 {
            DetectionFinding::failed(
                FindingCategory::BypassAttempts,
                FindingCode::BypassDetected,
                Severity::Warning,
                format!("{attempts} authority bypass attempts recorded"),
            )
        } else {
            DetectionFinding::ok(FindingCategory::BypassAttempts, "no bypass attempts recorded")
        };
        vec![finding]
    }

    fn check_mock_usage(&self) -> Vec<DetectionFinding> {
        let stats = self.authority.stats();
        if stats.total < self.config.min_decisions_for_ratio {
            return vec![DetectionFinding::ok(
                FindingCategory::MockUsage,
                format!("{} decisions, too few to judge placeholder usage", stats.total),
            )];
        }
        let ratio = stats.fallback_ratio();
        let message = format!(
            "{} of {} decisions served placeholders ({:.0}%)",
            stats.fallback,
            stats.total,
            ratio * 100.0
        );
        let finding = if ratio >= self.config.mock_ratio_critical {
            DetectionFinding::failed(
                FindingCategory::MockUsage,
                FindingCode::RepeatedMockUsage,
                Severity::Critical,
                message,
            )
            .with_action("restore live credentials and restart")
        } else if ratio >= self.config.mock_ratio_warning {
            DetectionFinding::failed(
                FindingCategory::MockUsage,
                FindingCode::ElevatedMockUsage,
                Severity::Warning,
                message,
            )
        } else {
            DetectionFinding::ok(FindingCategory::MockUsage, message)
        };
        vec![finding]
    }

    async fn check_process(&self) -> Result<Vec<DetectionFinding>, ProviderError> {
        let report = self.host.probe_process().await?;
        let mut findings = Vec::new();
        if report.port_conflict {
            findings.push(
                DetectionFinding::failed(
                    FindingCategory::ProcessHealth,
                    FindingCode::PortConflict,
                    Severity::Critical,
                    format!("port {} is held by another process: {}", report.port, report.details),
                )
                .with_action("release the port and restart"),
            );
        }
        if report.stale_processes > 0 {
            let severity = if report.stale_processes >= STALE_PROCESS_CRITICAL {
                Severity::Critical
            } else {
                Severity::Warning
            };
            findings.push(DetectionFinding::failed(
                FindingCategory::ProcessHealth,
                FindingCode::StaleProcesses,
                severity,
                format!("{} stale processes found", report.stale_processes),
            ));
        }
        if findings.is_empty() {
            findings.push(DetectionFinding::ok(
                FindingCategory::ProcessHealth,
                format!("port {} available, no stale processes", report.port),
            ));
        }
        Ok(findings)
    }

    async fn check_integrity(&self) -> Result<Vec<DetectionFinding>, ProviderError> {
        let report = self.host.check_integrity().await?;
        let finding = match report.status {
            IntegrityStatus::Healthy => {
                DetectionFinding::ok(FindingCategory::Integrity, report.message)
            }
            IntegrityStatus::Degraded => DetectionFinding::failed(
                FindingCategory::Integrity,
                FindingCode::IntegrityDegraded,
                Severity::Warning,
                report.message,
            ),
            IntegrityStatus::NotLoaded => DetectionFinding::failed(
                FindingCategory::Integrity,
                FindingCode::IntegrityNotLoaded,
                Severity::Critical,
                report.message,
            )
            .with_action("restart the protected service"),
        };
        Ok(vec![finding])
    }

    // -- alerts -------------------------------------------------------------

    pub fn on_alert(&self, callback: AlertCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    fn dispatch_alerts(&self, findings: &[DetectionFinding]) {
        let alerts: Vec<&DetectionFinding> = findings
            .iter()
            .filter(|f| !f.passed && f.severity.is_alert())
            .collect();
        if alerts.is_empty() {
            return;
        }
        // Callbacks may register tasks or read engine state; never call them
        // under the lock.
        let callbacks: Vec<AlertCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        for finding in alerts {
            if let Some(metrics) = &self.metrics {
                metrics.increment_counter(
                    names::ALERTS_RAISED,
                    &[
                        ("category", finding.category.as_str()),
                        ("severity", finding.severity.as_str()),
                    ],
                );
            }
            for callback in &callbacks {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(finding))).is_err() {
                    error!(category = %finding.category, "alert callback panicked");
                }
            }
        }
    }

    // -- monitoring ---------------------------------------------------------

    /// Register the recurring monitor task. Re-registering replaces it.
    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        self.start_monitoring_every(self.config.monitor_interval())
    }

    pub fn start_monitoring_every(self: &Arc<Self>, interval: Duration) -> bool {
        let engine: Weak<Self> = Arc::downgrade(self);
        let registered = self.scheduler.register_interval(
            MONITOR_TASK_ID,
            task_handler(move || {
                let engine = engine.clone();
                async move {
                    let engine = engine
                        .upgrade()
                        .ok_or_else(|| "detection engine dropped".to_string())?;
                    engine.perform_full_health_check().await;
                    Ok::<(), String>(())
                }
            }),
            interval,
            RegisterOptions::replacing(),
        );
        if registered {
            info!(interval_secs = interval.as_secs_f64(), "health monitoring started");
        }
        registered
    }

    pub fn stop_monitoring(&self) -> bool {
        let stopped = self.scheduler.unregister(MONITOR_TASK_ID);
        if stopped {
            info!("health monitoring stopped");
        }
        stopped
    }

    pub fn is_monitoring(&self) -> bool {
        self.scheduler.contains(MONITOR_TASK_ID)
    }

    // -- history ------------------------------------------------------------

    fn append_history(&self, findings: &[DetectionFinding]) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.extend(findings.iter().cloned());
        if history.len() > self.config.history_capacity {
            let excess = history.len() - self.config.history_trim_to.min(self.config.history_capacity);
            history.drain(..excess);
            debug!(dropped = excess, "findings history trimmed");
        }
    }

    /// Trim the history down to its trim target; returns how many were
    /// dropped.
    pub fn trim_history(&self) -> usize {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let excess = history.len().saturating_sub(self.config.history_trim_to);
        history.drain(..excess);
        excess
    }

    /// The most recent `limit` findings, oldest first.
    pub fn get_findings_history(&self, limit: usize) -> Vec<DetectionFinding> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn findings_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn last_snapshot(&self) -> Option<SystemHealthSnapshot> {
        self.last_snapshot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

fn count(findings: &[DetectionFinding], severity: Severity) -> usize {
    findings
        .iter()
        .filter(|f| !f.passed && f.severity == severity)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warning(category: FindingCategory) -> DetectionFinding {
        DetectionFinding::failed(category, FindingCode::CheckFailed, Severity::Warning, "w")
    }

    #[test]
    fn empty_findings_are_healthy() {
        assert_eq!(aggregate(&[]), OverallHealth::Healthy);
    }

    #[test]
    fn two_warnings_stay_healthy_three_degrade() {
        let mut findings = vec![
            warning(FindingCategory::Authority),
            warning(FindingCategory::MockUsage),
        ];
        assert_eq!(aggregate(&findings), OverallHealth::Healthy);
        findings.push(warning(FindingCategory::Integrity));
        assert_eq!(aggregate(&findings), OverallHealth::Degraded);
    }

    #[test]
    fn emergency_dominates_critical() {
        let findings = vec![
            DetectionFinding::failed(
                FindingCategory::Integrity,
                FindingCode::IntegrityNotLoaded,
                Severity::Critical,
                "c",
            ),
            DetectionFinding::failed(
                FindingCategory::CredentialPool,
                FindingCode::CredentialsExhausted,
                Severity::Emergency,
                "e",
            ),
        ];
        assert_eq!(aggregate(&findings), OverallHealth::Emergency);
        assert_eq!(aggregate(&findings[..1]), OverallHealth::Critical);
    }

    #[test]
    fn passing_findings_never_count() {
        let mut passing = DetectionFinding::ok(FindingCategory::Integrity, "fine");
        passing.severity = Severity::Emergency;
        assert_eq!(aggregate(&[passing]), OverallHealth::Healthy);
    }

    #[test]
    fn recommendations_are_deduplicated() {
        let findings = vec![
            warning(FindingCategory::Authority),
            warning(FindingCategory::Authority),
            warning(FindingCategory::MockUsage),
            DetectionFinding::ok(FindingCategory::Integrity, "fine"),
        ];
        let recs = recommendations(&findings);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0], FindingCategory::Authority.recommendation());
    }
}
