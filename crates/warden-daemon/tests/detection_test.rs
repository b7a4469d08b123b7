//! Integration tests for the health detection engine: per-category checks,
//! aggregation into a snapshot, alert dispatch, monitoring, and history.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{fixture, test_config, wait_for, MockHost, MockPool};
use warden_core::providers::IntegrityStatus;
use warden_core::types::{
    DetectionFinding, ExecutionContext, FindingCategory, FindingCode, OverallHealth, Severity,
};
use warden_daemon::detection::{DetectionError, MONITOR_TASK_ID};
use warden_telemetry::metrics::names;

fn failing(findings: &[DetectionFinding]) -> Vec<(FindingCategory, FindingCode, Severity)> {
    findings
        .iter()
        .filter(|f| !f.passed)
        .map(|f| (f.category, f.code, f.severity))
        .collect()
}

// ===========================================================================
// Full check
// ===========================================================================

#[tokio::test]
async fn healthy_system_reports_six_passing_findings() {
    let f = fixture(test_config(), MockPool::with_keys(3), MockHost::healthy());

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(snapshot.overall, OverallHealth::Healthy);
    assert_eq!(snapshot.findings.len(), 6);
    assert!(snapshot.findings.iter().all(|f| f.passed));
    assert!(snapshot.recommendations.is_empty());
    assert!(snapshot.summary.starts_with("6 findings, 0 failing"));
    assert_eq!(f.detection.findings_len(), 6);
    assert_eq!(
        f.metrics
            .get_counter(names::HEALTH_CHECKS, &[("overall", "healthy")]),
        1
    );
}

#[tokio::test]
async fn exhausted_pool_is_an_emergency() {
    let f = fixture(test_config(), MockPool::empty(), MockHost::healthy());

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(snapshot.overall, OverallHealth::Emergency);
    assert_eq!(
        failing(&snapshot.findings),
        vec![(
            FindingCategory::CredentialPool,
            FindingCode::CredentialsExhausted,
            Severity::Emergency
        )]
    );
    let finding = &snapshot.findings[0];
    assert!(finding.message.starts_with("no active API credentials"));
    assert!(finding.action_required.is_some());
    assert_eq!(
        snapshot.recommendations,
        vec![FindingCategory::CredentialPool.recommendation().to_string()]
    );
}

#[tokio::test]
async fn single_active_key_of_many_is_a_warning() {
    let pool = MockPool::with_keys(3);
    pool.set_active(1);
    let f = fixture(test_config(), pool, MockHost::healthy());

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(
        failing(&snapshot.findings),
        vec![(
            FindingCategory::CredentialPool,
            FindingCode::CredentialsLow,
            Severity::Warning
        )]
    );
    assert_eq!(snapshot.overall, OverallHealth::Healthy);
}

#[tokio::test]
async fn status_outage_and_port_conflict_are_critical() {
    let host = MockHost::healthy();
    host.set_port_conflict(true);
    let f = fixture(test_config(), MockPool::with_keys(2), host);
    f.status.set(false, "draining");

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(snapshot.overall, OverallHealth::Critical);
    let failing = failing(&snapshot.findings);
    assert!(failing.contains(&(
        FindingCategory::Authority,
        FindingCode::AuthorityUnavailable,
        Severity::Critical
    )));
    assert!(failing.contains(&(
        FindingCategory::ProcessHealth,
        FindingCode::PortConflict,
        Severity::Critical
    )));
    assert_eq!(snapshot.count(Severity::Critical), 2);
}

#[tokio::test]
async fn three_warnings_degrade_health() {
    let pool = MockPool::with_keys(2);
    pool.set_active(1);
    let host = MockHost::healthy();
    host.set_stale_processes(1);
    host.set_integrity(IntegrityStatus::Degraded);
    let f = fixture(test_config(), pool, host);

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(snapshot.count(Severity::Warning), 3);
    assert_eq!(snapshot.overall, OverallHealth::Degraded);
}

#[tokio::test]
async fn many_stale_processes_are_critical() {
    let host = MockHost::healthy();
    host.set_stale_processes(3);
    let f = fixture(test_config(), MockPool::with_keys(1), host);

    let findings = f.detection.check_category("process_health").await.unwrap();

    assert_eq!(
        failing(&findings),
        vec![(
            FindingCategory::ProcessHealth,
            FindingCode::StaleProcesses,
            Severity::Critical
        )]
    );
}

#[tokio::test]
async fn collaborator_error_becomes_check_failed_warning() {
    let host = MockHost::healthy();
    host.set_probe_fails(true);
    let f = fixture(test_config(), MockPool::with_keys(1), host);

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(
        failing(&snapshot.findings),
        vec![(
            FindingCategory::ProcessHealth,
            FindingCode::CheckFailed,
            Severity::Warning
        )]
    );
    assert_eq!(snapshot.overall, OverallHealth::Healthy);
}

#[tokio::test]
async fn integrity_not_loaded_is_critical() {
    let host = MockHost::healthy();
    host.set_integrity(IntegrityStatus::NotLoaded);
    let f = fixture(test_config(), MockPool::with_keys(1), host);

    let findings = f.detection.check_category("integrity").await.unwrap();

    assert_eq!(findings[0].code, FindingCode::IntegrityNotLoaded);
    assert_eq!(findings[0].severity, Severity::Critical);
}

// ===========================================================================
// Authority-derived checks
// ===========================================================================

#[tokio::test]
async fn repeated_fallbacks_are_repeated_mock_usage() {
    let mut config = test_config();
    config.service.allow_mock = true;
    let f = fixture(config, MockPool::empty(), MockHost::healthy());
    for _ in 0..4 {
        f.authority
            .authorize_execution(&ExecutionContext::new("generate", "worker"))
            .await;
    }

    let findings = f.detection.check_category("mock-usage").await.unwrap();

    assert_eq!(
        failing(&findings),
        vec![(
            FindingCategory::MockUsage,
            FindingCode::RepeatedMockUsage,
            Severity::Critical
        )]
    );
}

#[tokio::test]
async fn mock_usage_needs_enough_decisions() {
    let mut config = test_config();
    config.service.allow_mock = true;
    let f = fixture(config, MockPool::empty(), MockHost::healthy());
    f.authority
        .authorize_execution(&ExecutionContext::new("generate", "worker"))
        .await;

    let findings = f.detection.check_category("mock_usage").await.unwrap();
    assert!(findings[0].passed);
}

#[tokio::test]
async fn mostly_denied_decisions_raise_a_warning() {
    let f = fixture(test_config(), MockPool::empty(), MockHost::healthy());
    for _ in 0..4 {
        f.authority
            .authorize_execution(&ExecutionContext::new("generate", "worker"))
            .await;
    }

    let findings = f.detection.check_category("authority").await.unwrap();

    assert_eq!(
        failing(&findings),
        vec![(
            FindingCategory::Authority,
            FindingCode::AuthorityDenials,
            Severity::Warning
        )]
    );
}

#[tokio::test]
async fn bypass_attempts_escalate_with_count() {
    let mut config = test_config();
    config.detection.bypass_critical_threshold = 3;
    let f = fixture(config, MockPool::with_keys(1), MockHost::healthy());

    f.authority.record_bypass_attempt("generate", "direct_call");
    let findings = f.detection.check_category("bypass_attempts").await.unwrap();
    assert_eq!(findings[0].severity, Severity::Warning);

    f.authority.record_bypass_attempt("generate", "direct_call");
    f.authority.record_bypass_attempt("generate", "direct_call");
    let findings = f.detection.check_category("bypass_attempts").await.unwrap();
    assert_eq!(findings[0].severity, Severity::Critical);
    assert_eq!(findings[0].code, FindingCode::BypassDetected);
}

#[tokio::test]
async fn unknown_category_is_an_error() {
    let f = fixture(test_config(), MockPool::with_keys(1), MockHost::healthy());

    let err = f.detection.check_category("network").await.unwrap_err();

    assert!(matches!(err, DetectionError::UnknownCategory(ref name) if name == "network"));
}

// ===========================================================================
// Alerts
// ===========================================================================

#[tokio::test]
async fn alerts_reach_every_callback_despite_panics() {
    let f = fixture(test_config(), MockPool::empty(), MockHost::healthy());
    let seen = Arc::new(Mutex::new(Vec::new()));

    f.detection.on_alert(Arc::new(|_: &DetectionFinding| panic!("bad callback")));
    let sink = seen.clone();
    f.detection.on_alert(Arc::new(move |finding: &DetectionFinding| {
        sink.lock().unwrap().push((finding.category, finding.severity));
    }));

    let snapshot = f.detection.perform_full_health_check().await;

    assert_eq!(snapshot.overall, OverallHealth::Emergency);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(FindingCategory::CredentialPool, Severity::Emergency)]
    );
    assert_eq!(
        f.metrics.get_counter(
            names::ALERTS_RAISED,
            &[("category", "credential_pool"), ("severity", "emergency")]
        ),
        1
    );
}

#[tokio::test]
async fn warnings_are_not_dispatched_as_alerts() {
    let pool = MockPool::with_keys(2);
    pool.set_active(1);
    let f = fixture(test_config(), pool, MockHost::healthy());
    let alerts = Arc::new(AtomicU32::new(0));
    let counter = alerts.clone();
    f.detection.on_alert(Arc::new(move |_: &DetectionFinding| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    f.detection.perform_full_health_check().await;

    assert_eq!(alerts.load(Ordering::SeqCst), 0);
}

// ===========================================================================
// Monitoring and history
// ===========================================================================

#[tokio::test]
async fn monitoring_registers_one_recurring_task() {
    let f = fixture(test_config(), MockPool::with_keys(1), MockHost::healthy());

    assert!(f.detection.start_monitoring_every(Duration::from_millis(20)));
    assert!(f.detection.start_monitoring_every(Duration::from_millis(20)));
    assert_eq!(f.scheduler.len(), 1);
    assert!(f.detection.is_monitoring());

    let detection = f.detection.clone();
    assert!(wait_for(Duration::from_secs(2), || detection.last_snapshot().is_some()).await);

    assert!(f.detection.stop_monitoring());
    assert!(!f.detection.is_monitoring());
    assert!(!f.scheduler.contains(MONITOR_TASK_ID));
}

#[tokio::test]
async fn history_is_trimmed_and_limited() {
    let mut config = test_config();
    config.detection.history_capacity = 10;
    config.detection.history_trim_to = 4;
    let f = fixture(config, MockPool::with_keys(1), MockHost::healthy());

    f.detection.perform_full_health_check().await;
    assert_eq!(f.detection.findings_len(), 6);
    f.detection.perform_full_health_check().await;
    assert_eq!(f.detection.findings_len(), 4);

    let last_two = f.detection.get_findings_history(2);
    assert_eq!(last_two.len(), 2);
    assert_eq!(last_two[1].category, FindingCategory::Integrity);

    assert_eq!(f.detection.trim_history(), 0);
}
