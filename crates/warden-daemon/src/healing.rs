//! Self-healing orchestration.
//!
//! The orchestrator turns detection alerts into remediation. A critical or
//! emergency alert schedules one delayed healing pass (exponential backoff
//! on consecutive failures); a low-frequency periodic task catches slow
//! degradation. Each pass maps failing findings to actions, runs them in
//! priority order under the `self-healing` circuit breaker, and keeps score.
//!
//! Too many failed passes in a row, or a failure that no retry can fix,
//! puts the orchestrator into **Dormant Mode**: all automatic healing stops
//! until an operator calls [`SelfHealingOrchestrator::resume_from_dormant`].

mod actions;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_core::config::HealingConfig;
use warden_core::providers::{CredentialPool, ServiceHost};
use warden_core::types::{
    ActionType, DetectionFinding, DormantModeRecord, FindingCategory, FindingCode, HealingAction,
    HealingResult, OverallHealth, Severity, SystemHealthSnapshot,
};
use warden_harness::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitStatus,
};
use warden_harness::scheduler::{task_handler, RegisterOptions, TaskScheduler};
use warden_telemetry::metrics::{names, MetricsCollector};

use crate::detection::DetectionEngine;

pub const BREAKER_NAME: &str = "self-healing";
pub const PERIODIC_TASK_ID: &str = "self-healing:periodic";
pub const ALERT_TASK_PREFIX: &str = "self-healing:alert:";
pub const ALERT_TASK_PATTERN: &str = "self-healing:alert:*";

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// The remediation for one failing finding, if any.
///
/// Matched on the code first so that a new [`FindingCode`] cannot compile
/// without a decision here; the category must agree with the code.
pub fn action_for(category: FindingCategory, code: FindingCode) -> Option<ActionType> {
    use FindingCategory as C;
    use FindingCode as K;
    match code {
        K::CredentialsExhausted | K::CredentialsLow => {
            (category == C::CredentialPool).then_some(ActionType::CredentialRotation)
        }
        K::RepeatedMockUsage | K::ElevatedMockUsage => {
            (category == C::MockUsage).then_some(ActionType::MockRecovery)
        }
        K::AuthorityUnavailable => (category == C::Authority).then_some(ActionType::Restart),
        K::IntegrityNotLoaded => (category == C::Integrity).then_some(ActionType::Restart),
        K::PortConflict | K::StaleProcesses => {
            (category == C::ProcessHealth).then_some(ActionType::ProcessCleanup)
        }
        K::AuthorityDenials
        | K::BypassDetected
        | K::IntegrityDegraded
        | K::Healthy
        | K::CheckFailed => None,
    }
}

/// Build a pass plan from a snapshot, highest priority first.
///
/// Only critical and emergency findings produce actions; more than two
/// warnings add a preventive maintenance action. Actions with the same id
/// are collapsed, keeping the highest priority.
pub fn plan_actions(snapshot: &SystemHealthSnapshot) -> Vec<HealingAction> {
    let mut plan: Vec<HealingAction> = Vec::new();
    for finding in snapshot
        .findings
        .iter()
        .filter(|f| !f.passed && f.severity.is_alert())
    {
        let Some(action_type) = action_for(finding.category, finding.code) else {
            continue;
        };
        let action = HealingAction::new(
            action_type,
            finding.severity,
            Some(finding.category),
            finding.message.clone(),
        );
        match plan.iter_mut().find(|a| a.id == action.id) {
            Some(existing) if existing.priority < action.priority => *existing = action,
            Some(_) => {}
            None => plan.push(action),
        }
    }

    let warnings = snapshot.count(Severity::Warning);
    if warnings > 2 {
        plan.push(HealingAction::new(
            ActionType::PreventiveMaintenance,
            Severity::Warning,
            None,
            format!("{warnings} warnings outstanding"),
        ));
    }

    plan.sort_by(|a, b| b.priority.cmp(&a.priority));
    plan
}

/// `min(base * 2^failures, max)`.
pub fn backoff_for(base: Duration, max: Duration, consecutive_failures: u32) -> Duration {
    let factor = 2u32.checked_pow(consecutive_failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingStats {
    pub enabled: bool,
    pub dormant: bool,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub current_backoff_ms: u64,
    pub total_passes: u64,
    pub successful_actions: u64,
    pub failed_actions: u64,
    pub dormant_entries: u64,
    pub in_flight: Vec<String>,
    pub history_len: usize,
    pub last_pass: Option<DateTime<Utc>>,
    pub breaker: CircuitStatus,
}

/// What started a healing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Alert,
    Periodic,
    Manual,
}

#[derive(Debug)]
struct HealingState {
    enabled: bool,
    consecutive_failures: u32,
    backoff: Duration,
    dormant: Option<DormantModeRecord>,
    in_flight: HashSet<String>,
    pass_running: bool,
    history: VecDeque<HealingResult>,
    total_passes: u64,
    successful_actions: u64,
    failed_actions: u64,
    dormant_entries: u64,
    last_pass: Option<DateTime<Utc>>,
}

/// Every action in a pass failed. Returned inside the breaker so the pass
/// counts as a breaker failure.
#[derive(Debug, thiserror::Error)]
#[error("all {} healing actions failed", .results.len())]
struct PassFailed {
    results: Vec<HealingResult>,
}

/// Clears the pass-running flag on every exit path.
struct PassGuard<'a> {
    state: &'a Mutex<HealingState>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pass_running = false;
    }
}

// ---------------------------------------------------------------------------
// SelfHealingOrchestrator
// ---------------------------------------------------------------------------

pub struct SelfHealingOrchestrator {
    config: HealingConfig,
    detection: Arc<DetectionEngine>,
    credentials: Arc<dyn CredentialPool>,
    host: Arc<dyn ServiceHost>,
    scheduler: Arc<TaskScheduler>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker: CircuitBreaker,
    metrics: Option<Arc<MetricsCollector>>,
    state: Mutex<HealingState>,
    subscribed: AtomicBool,
    me: Weak<SelfHealingOrchestrator>,
}

impl std::fmt::Debug for SelfHealingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHealingOrchestrator")
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl SelfHealingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HealingConfig,
        detection: Arc<DetectionEngine>,
        credentials: Arc<dyn CredentialPool>,
        host: Arc<dyn ServiceHost>,
        scheduler: Arc<TaskScheduler>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Arc<Self> {
        let breaker_config = config.breaker.to_breaker_config();
        let breaker = breakers.get_or_create_with(BREAKER_NAME, || breaker_config);
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(HealingState {
                enabled: config.enabled,
                consecutive_failures: 0,
                backoff: config.base_backoff(),
                dormant: None,
                in_flight: HashSet::new(),
                pass_running: false,
                history: VecDeque::new(),
                total_passes: 0,
                successful_actions: 0,
                failed_actions: 0,
                dormant_entries: 0,
                last_pass: None,
            }),
            config,
            detection,
            credentials,
            host,
            scheduler,
            breakers,
            breaker,
            metrics,
            subscribed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HealingState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        backoff_for(
            self.config.base_backoff(),
            self.config.max_backoff(),
            consecutive_failures,
        )
    }

    // -- lifecycle ----------------------------------------------------------

    /// Subscribe to detection alerts and register the periodic task.
    /// Returns false when healing is disabled by config.
    pub fn start(&self) -> bool {
        self.start_every(self.config.periodic_interval())
    }

    pub fn start_every(&self, periodic_interval: Duration) -> bool {
        if !self.config.enabled {
            info!("self-healing disabled by config");
            return false;
        }
        self.lock().enabled = true;

        if !self.subscribed.swap(true, Ordering::SeqCst) {
            let me = self.me.clone();
            self.detection.on_alert(Arc::new(move |finding: &DetectionFinding| {
                if let Some(orchestrator) = me.upgrade() {
                    orchestrator.handle_alert(finding);
                }
            }));
        }

        let me = self.me.clone();
        let registered = self.scheduler.register_interval(
            PERIODIC_TASK_ID,
            task_handler(move || {
                let me = me.clone();
                async move {
                    if let Some(orchestrator) = me.upgrade() {
                        orchestrator.periodic_check().await;
                    }
                    Ok(())
                }
            }),
            periodic_interval,
            RegisterOptions {
                enabled: !self.is_dormant(),
                replace: true,
            },
        );
        info!(
            periodic_secs = periodic_interval.as_secs_f64(),
            registered, "self-healing started"
        );
        registered
    }

    /// Disable automatic healing: drop the periodic task and any pending
    /// alert passes. Manual healing still works.
    pub fn stop_automatic_healing(&self) {
        self.lock().enabled = false;
        self.scheduler.unregister(PERIODIC_TASK_ID);
        let cancelled = self.scheduler.cancel_tasks_by_pattern(ALERT_TASK_PATTERN);
        info!(cancelled, "automatic healing stopped");
    }

    // -- triggers -----------------------------------------------------------

    /// Schedule a delayed healing pass for a critical or emergency finding.
    ///
    /// Ignored while disabled, dormant, or mid-pass, and when a pass for the
    /// same category is already pending.
    pub fn handle_alert(&self, finding: &DetectionFinding) {
        if !finding.severity.is_alert() {
            return;
        }
        let delay = {
            let state = self.lock();
            if !state.enabled || state.dormant.is_some() || state.pass_running {
                debug!(category = %finding.category, "alert ignored");
                return;
            }
            self.backoff_for(state.consecutive_failures)
        };

        let prefix = format!("{ALERT_TASK_PREFIX}{}:", finding.category);
        if self
            .scheduler
            .list_tasks()
            .iter()
            .any(|t| t.id.starts_with(&prefix))
        {
            debug!(category = %finding.category, "healing pass already pending");
            return;
        }

        let task_id = format!("{prefix}{}", Uuid::new_v4());
        let me = self.me.clone();
        let registered = self.scheduler.register_timeout(
            &task_id,
            task_handler(move || {
                let me = me.clone();
                async move {
                    if let Some(orchestrator) = me.upgrade() {
                        orchestrator.perform_automatic_healing().await;
                    }
                    Ok(())
                }
            }),
            delay,
        );
        if registered {
            info!(
                task_id = %task_id,
                severity = ?finding.severity,
                delay_ms = delay.as_millis() as u64,
                "healing pass scheduled for alert"
            );
        }
    }

    /// Periodic task body: heal only when health has drifted to Degraded.
    async fn periodic_check(&self) {
        if self.is_dormant() || !self.is_enabled() {
            return;
        }
        let snapshot = self.detection.perform_full_health_check().await;
        if snapshot.overall == OverallHealth::Degraded {
            self.heal(Trigger::Periodic, Some(snapshot), None).await;
        } else {
            debug!(overall = ?snapshot.overall, "periodic check: no healing needed");
        }
    }

    /// Run a full healing pass now. Returns `[]` when dormant or disabled.
    pub async fn perform_automatic_healing(&self) -> Vec<HealingResult> {
        self.heal(Trigger::Alert, None, None).await
    }

    /// Operator-requested healing: a full pass, or just one action type.
    /// Works while automatic healing is stopped, but never while dormant.
    pub async fn manual_heal(&self, action: Option<ActionType>) -> Vec<HealingResult> {
        self.heal(Trigger::Manual, None, action).await
    }

    async fn heal(
        &self,
        trigger: Trigger,
        snapshot: Option<SystemHealthSnapshot>,
        only: Option<ActionType>,
    ) -> Vec<HealingResult> {
        let ceiling = self.config.max_consecutive_failures;
        let at_ceiling = {
            let mut state = self.lock();
            if state.dormant.is_some() {
                debug!(?trigger, "dormant, healing pass skipped");
                return Vec::new();
            }
            if trigger != Trigger::Manual && !state.enabled {
                debug!(?trigger, "healing disabled, pass skipped");
                return Vec::new();
            }
            if state.pass_running {
                debug!(?trigger, "healing pass already running");
                return Vec::new();
            }
            let at_ceiling = state.consecutive_failures >= ceiling;
            state.pass_running = !at_ceiling;
            at_ceiling
        };
        if at_ceiling {
            self.enter_dormant(
                format!("{ceiling} consecutive healing failures reached the ceiling"),
                "consecutive_failures",
            );
            return Vec::new();
        }
        let _guard = PassGuard { state: &self.state };
        let started = Instant::now();

        let plan = match only {
            Some(action_type) => vec![HealingAction::new(
                action_type,
                Severity::Critical,
                None,
                "manual healing request",
            )
            .manual()],
            None => {
                let snapshot = match snapshot {
                    Some(s) => s,
                    None => self.detection.perform_full_health_check().await,
                };
                plan_actions(&snapshot)
            }
        };
        if plan.is_empty() {
            debug!(?trigger, "no healing actions needed");
            return Vec::new();
        }
        info!(?trigger, actions = plan.len(), "healing pass starting");

        let results = match self.breaker.execute(|| self.run_plan(plan)).await {
            Ok(results) => results,
            Err(BreakerError::Operation(PassFailed { results })) => results,
            Err(rejection) => {
                warn!(error = %rejection, "healing pass refused by circuit breaker");
                return Vec::new();
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_histogram(names::HEALING_PASS_DURATION, started.elapsed().as_secs_f64());
        }
        self.finish_pass(&results);
        results
    }

    /// Execute a plan sequentially. Follow-ups run right after the action
    /// that proposed them; an unrecoverable failure ends the pass.
    async fn run_plan(&self, plan: Vec<HealingAction>) -> Result<Vec<HealingResult>, PassFailed> {
        let mut results = Vec::new();
        'plan: for action in plan {
            let Some(result) = self.run_action(&action).await else {
                continue;
            };
            let follow_ups = if result.success {
                result.follow_up_actions.clone()
            } else {
                Vec::new()
            };
            let stop = result.unrecoverable && !result.success;
            results.push(result);
            if stop {
                break 'plan;
            }
            for follow_up in follow_ups {
                let next = HealingAction::new(
                    follow_up,
                    action.severity,
                    action.source,
                    format!("follow-up to {}", action.id),
                );
                if let Some(result) = self.run_action(&next).await {
                    let stop = result.unrecoverable && !result.success;
                    results.push(result);
                    if stop {
                        break 'plan;
                    }
                }
            }
        }

        if !results.is_empty() && results.iter().all(|r| !r.success) {
            Err(PassFailed { results })
        } else {
            Ok(results)
        }
    }

    /// Run one action unless the same id is already in flight.
    async fn run_action(&self, action: &HealingAction) -> Option<HealingResult> {
        if !self.lock().in_flight.insert(action.id.clone()) {
            debug!(action_id = %action.id, "action already in flight, skipped");
            return None;
        }
        let result = self.execute_action(action).await;
        self.lock().in_flight.remove(&action.id);

        if result.success {
            info!(action_id = %action.id, duration_ms = result.duration_ms, "healing action succeeded");
        } else {
            warn!(
                action_id = %action.id,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "healing action failed"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                names::HEALING_ACTIONS,
                &[
                    ("action", action.action_type.as_str()),
                    ("outcome", if result.success { "success" } else { "failure" }),
                ],
            );
        }
        Some(result)
    }

    /// Record results and update the failure streak.
    fn finish_pass(&self, results: &[HealingResult]) {
        let successes = results.iter().filter(|r| r.success).count();
        let unrecoverable = results
            .iter()
            .find(|r| r.unrecoverable && !r.success)
            .map(|r| {
                (
                    r.error_message.clone().unwrap_or_default(),
                    r.action.id.clone(),
                )
            });

        let reached_ceiling = {
            let mut state = self.lock();
            state.total_passes += 1;
            state.last_pass = Some(Utc::now());
            state.successful_actions += successes as u64;
            state.failed_actions += (results.len() - successes) as u64;
            state.history.extend(results.iter().cloned());
            if state.history.len() > self.config.history_capacity {
                let excess = state.history.len()
                    - self.config.history_trim_to.min(self.config.history_capacity);
                state.history.drain(..excess);
            }

            if successes > 0 {
                state.consecutive_failures = 0;
                state.backoff = self.config.base_backoff();
            } else {
                state.consecutive_failures += 1;
                state.backoff = self.backoff_for(state.consecutive_failures);
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_gauge(
                    names::CONSECUTIVE_HEALING_FAILURES,
                    &[],
                    i64::from(state.consecutive_failures),
                );
            }
            info!(
                actions = results.len(),
                successes,
                consecutive_failures = state.consecutive_failures,
                "healing pass finished"
            );
            state.consecutive_failures >= self.config.max_consecutive_failures
        };

        if let Some((error, action_id)) = unrecoverable {
            self.enter_dormant(
                format!("manual configuration required: {error}"),
                &action_id,
            );
        } else if reached_ceiling {
            self.enter_dormant(
                format!(
                    "{} consecutive healing failures reached the ceiling",
                    self.config.max_consecutive_failures
                ),
                "consecutive_failures",
            );
        }
    }

    // -- dormant mode -------------------------------------------------------

    fn enter_dormant(&self, reason: String, triggered_by: &str) {
        {
            let mut state = self.lock();
            if state.dormant.is_some() {
                return;
            }
            let mut resume_conditions = vec![
                "the underlying cause has been fixed by an operator".to_string(),
                "resume_from_dormant has been called".to_string(),
            ];
            if reason.starts_with("manual configuration required") {
                resume_conditions.insert(0, "at least one valid API credential is configured".to_string());
            }
            state.dormant = Some(DormantModeRecord {
                reason: reason.clone(),
                timestamp: Utc::now(),
                triggered_by: triggered_by.to_string(),
                resume_conditions,
                manual_reset_required: true,
            });
            state.dormant_entries += 1;
        }

        error!(
            reason = %reason,
            triggered_by,
            "ENTERING DORMANT MODE – automatic healing halted until manual resume"
        );
        self.scheduler.pause_task(PERIODIC_TASK_ID);
        let cancelled = self.scheduler.cancel_tasks_by_pattern(ALERT_TASK_PATTERN);
        debug!(cancelled, "pending alert passes cancelled");
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(names::DORMANT, &[], 1);
        }
    }

    /// Leave Dormant Mode. Always clears the record and resets the failure
    /// streak; returns whether the orchestrator was dormant.
    pub async fn resume_from_dormant(&self, reason: &str) -> bool {
        let previous = {
            let mut state = self.lock();
            state.consecutive_failures = 0;
            state.backoff = self.config.base_backoff();
            state.dormant.take()
        };

        if self.breaker.is_permanently_open().await {
            self.breaker.reset(true).await;
        }
        self.scheduler.resume_task(PERIODIC_TASK_ID);
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(names::DORMANT, &[], 0);
            metrics.set_gauge(names::CONSECUTIVE_HEALING_FAILURES, &[], 0);
        }

        match &previous {
            Some(record) => info!(
                resume_reason = reason,
                dormant_reason = %record.reason,
                "resumed from dormant mode"
            ),
            None => info!(resume_reason = reason, "resume requested while not dormant"),
        }
        previous.is_some()
    }

    /// Whether automatic healing is currently on.
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_dormant(&self) -> bool {
        self.lock().dormant.is_some()
    }

    pub fn get_dormant_status(&self) -> Option<DormantModeRecord> {
        self.lock().dormant.clone()
    }

    // -- queries ------------------------------------------------------------

    pub async fn get_healing_stats(&self) -> HealingStats {
        let breaker = self.breaker.status().await;
        let state = self.lock();
        let mut in_flight: Vec<String> = state.in_flight.iter().cloned().collect();
        in_flight.sort();
        HealingStats {
            enabled: state.enabled,
            dormant: state.dormant.is_some(),
            consecutive_failures: state.consecutive_failures,
            max_consecutive_failures: self.config.max_consecutive_failures,
            current_backoff_ms: state.backoff.as_millis() as u64,
            total_passes: state.total_passes,
            successful_actions: state.successful_actions,
            failed_actions: state.failed_actions,
            dormant_entries: state.dormant_entries,
            in_flight,
            history_len: state.history.len(),
            last_pass: state.last_pass,
            breaker,
        }
    }

    /// The most recent `limit` results, oldest first.
    pub fn get_healing_history(&self, limit: usize) -> Vec<HealingResult> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    fn trim_history(&self) -> usize {
        let mut state = self.lock();
        let excess = state.history.len().saturating_sub(self.config.history_trim_to);
        state.history.drain(..excess);
        excess
    }
}
