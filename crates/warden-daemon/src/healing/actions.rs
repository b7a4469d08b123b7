use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};
use warden_core::providers::{CleanupStep, IntegrityStatus};
use warden_core::types::{ActionType, HealingAction, HealingResult};
use warden_harness::circuit_breaker::CircuitState;

use super::SelfHealingOrchestrator;

/// What an action observed, before timing is attached.
#[derive(Debug, Default)]
struct Report {
    success: bool,
    details: Vec<String>,
    follow_ups: Vec<ActionType>,
    error: Option<String>,
    unrecoverable: bool,
}

impl Report {
    fn ok(details: Vec<String>) -> Self {
        Self {
            success: true,
            details,
            ..Self::default()
        }
    }

    fn failed(details: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            details,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

impl SelfHealingOrchestrator {
    /// Run one action. Never fails: every problem is folded into the result.
    pub(super) async fn execute_action(&self, action: &HealingAction) -> HealingResult {
        let started = Instant::now();
        debug!(action_id = %action.id, priority = action.priority, "executing healing action");

        let report = match action.action_type {
            ActionType::CredentialRotation => self.rotate_credentials().await,
            ActionType::MockRecovery => self.recover_from_mock().await,
            ActionType::Restart => self.restart_service().await,
            ActionType::ProcessCleanup => self.cleanup_processes().await,
            ActionType::PreventiveMaintenance => self.preventive_maintenance().await,
        };

        HealingResult {
            action: action.clone(),
            success: report.success,
            duration_ms: started.elapsed().as_millis() as u64,
            details: report.details,
            follow_up_actions: report.follow_ups,
            error_message: report.error,
            unrecoverable: report.unrecoverable,
            timestamp: Utc::now(),
        }
    }

    async fn rotate_credentials(&self) -> Report {
        let stats = self.credentials.stats().await;
        let mut details = vec![format!(
            "pool: {} total, {} active, {} exhausted",
            stats.total, stats.active, stats.exhausted
        )];
        if stats.active == 0 {
            return Report {
                unrecoverable: true,
                ..Report::failed(details, "no active API credentials; add or re-enable keys")
            };
        }

        match self.credentials.rotate().await {
            Some(credential) => {
                details.push(format!("rotated to {}", credential.id));
                Report::ok(details)
            }
            None => Report::failed(details, "rotation found no usable credential"),
        }
    }

    async fn recover_from_mock(&self) -> Report {
        let rotation = self.rotate_credentials().await;
        if !rotation.success {
            let error = rotation
                .error
                .unwrap_or_else(|| "credential rotation failed".to_string());
            return Report {
                unrecoverable: rotation.unrecoverable,
                ..Report::failed(rotation.details, error)
            };
        }

        let restart = self.restart_service().await;
        let mut details = rotation.details;
        details.extend(restart.details);
        if restart.success {
            Report::ok(details)
        } else {
            Report::failed(
                details,
                restart.error.unwrap_or_else(|| "restart failed".to_string()),
            )
        }
    }

    async fn restart_service(&self) -> Report {
        let mut details = Vec::new();
        if let Err(e) = self.host.restart().await {
            return Report::failed(details, format!("restart failed: {e}"));
        }
        details.push("service restarted".to_string());

        match self.host.check_integrity().await {
            Ok(report) => {
                details.push(format!("integrity {:?}: {}", report.status, report.message));
                match report.status {
                    IntegrityStatus::Healthy | IntegrityStatus::Degraded => Report::ok(details),
                    IntegrityStatus::NotLoaded => {
                        Report::failed(details, "service core still not loaded after restart")
                    }
                }
            }
            Err(e) => Report::failed(details, format!("integrity check failed: {e}")),
        }
    }

    async fn cleanup_processes(&self) -> Report {
        let mut details = Vec::new();
        let conflict_before = match self.host.probe_process().await {
            Ok(report) => {
                details.push(format!("before: {}", report.details));
                report.port_conflict
            }
            Err(e) => {
                details.push(format!("probe failed: {e}"));
                false
            }
        };

        let mut succeeded = 0;
        for step in CleanupStep::ALL {
            match self.host.cleanup_step(step).await {
                Ok(outcome) => {
                    succeeded += 1;
                    details.push(format!("{step:?}: {outcome}"));
                }
                Err(e) => {
                    warn!(?step, error = %e, "cleanup step failed");
                    details.push(format!("{step:?} failed: {e}"));
                }
            }
        }
        details.push(format!(
            "{succeeded}/{} cleanup steps succeeded",
            CleanupStep::ALL.len()
        ));

        let conflict_after = match self.host.probe_process().await {
            Ok(report) => {
                details.push(format!("after: {}", report.details));
                report.port_conflict
            }
            Err(e) => {
                details.push(format!("probe failed: {e}"));
                true
            }
        };

        if succeeded == 0 {
            return Report::failed(details, "every cleanup step failed");
        }
        if conflict_after {
            return Report::failed(details, "port conflict persists after cleanup");
        }
        let mut report = Report::ok(details);
        if conflict_before {
            report.follow_ups.push(ActionType::Restart);
        }
        report
    }

    async fn preventive_maintenance(&self) -> Report {
        let mut details = Vec::new();
        let mut failures = Vec::new();

        let dropped = self.detection.trim_history();
        details.push(format!("trimmed {dropped} detection findings"));

        let dropped = self.trim_history();
        details.push(format!("trimmed {dropped} healing results"));

        let (tasks, capacity) = (self.scheduler.len(), self.scheduler.capacity());
        if tasks < capacity {
            details.push(format!("scheduler at {tasks}/{capacity} tasks"));
        } else {
            failures.push(format!("scheduler is full ({tasks}/{capacity} tasks)"));
        }

        let mut stuck = Vec::new();
        for breaker in self.breakers.get_all() {
            if breaker.state().await == CircuitState::PermanentOpen {
                stuck.push(breaker.name().to_string());
            }
        }
        if stuck.is_empty() {
            details.push("no permanently open circuits".to_string());
        } else {
            stuck.sort();
            failures.push(format!("permanently open circuits: {}", stuck.join(", ")));
        }

        if failures.is_empty() {
            Report::ok(details)
        } else {
            details.extend(failures.iter().cloned());
            Report::failed(details, failures.join("; "))
        }
    }
}
