use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl Severity {
    /// Base priority contribution when ranking healing actions.
    pub fn weight(self) -> u32 {
        match self {
            Severity::Info => 10,
            Severity::Warning => 25,
            Severity::Critical => 75,
            Severity::Emergency => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }

    /// Critical and emergency findings are dispatched as alerts.
    pub fn is_alert(self) -> bool {
        matches!(self, Severity::Critical | Severity::Emergency)
    }
}

// ---------------------------------------------------------------------------
// FindingCategory / FindingCode
// ---------------------------------------------------------------------------

/// The independent checks run by the detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    CredentialPool,
    Authority,
    BypassAttempts,
    MockUsage,
    ProcessHealth,
    Integrity,
}

impl FindingCategory {
    pub const ALL: [FindingCategory; 6] = [
        FindingCategory::CredentialPool,
        FindingCategory::Authority,
        FindingCategory::BypassAttempts,
        FindingCategory::MockUsage,
        FindingCategory::ProcessHealth,
        FindingCategory::Integrity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FindingCategory::CredentialPool => "credential_pool",
            FindingCategory::Authority => "authority",
            FindingCategory::BypassAttempts => "bypass_attempts",
            FindingCategory::MockUsage => "mock_usage",
            FindingCategory::ProcessHealth => "process_health",
            FindingCategory::Integrity => "integrity",
        }
    }

    /// Operator advice attached to snapshots when this category fails.
    pub fn recommendation(self) -> &'static str {
        match self {
            FindingCategory::CredentialPool => {
                "Add or re-enable API credentials; the pool has too few active keys"
            }
            FindingCategory::Authority => {
                "Inspect the execution authority and system status provider"
            }
            FindingCategory::BypassAttempts => {
                "Audit callers issuing protected calls outside the guarded executor"
            }
            FindingCategory::MockUsage => {
                "Placeholder responses are being served; restore live credentials"
            }
            FindingCategory::ProcessHealth => {
                "Check for stale processes or another service holding the port"
            }
            FindingCategory::Integrity => "Verify the service core loaded correctly; consider a restart",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        FindingCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown finding category `{s}`"))
    }
}

/// What a check actually observed. Paired with the category this drives the
/// finding → healing action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCode {
    Healthy,
    CredentialsExhausted,
    CredentialsLow,
    AuthorityUnavailable,
    AuthorityDenials,
    BypassDetected,
    RepeatedMockUsage,
    ElevatedMockUsage,
    PortConflict,
    StaleProcesses,
    IntegrityNotLoaded,
    IntegrityDegraded,
    CheckFailed,
}

// ---------------------------------------------------------------------------
// DetectionFinding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionFinding {
    pub category: FindingCategory,
    pub code: FindingCode,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
    pub action_required: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionFinding {
    /// A passing, informational finding.
    pub fn ok(category: FindingCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: FindingCode::Healthy,
            severity: Severity::Info,
            passed: true,
            message: message.into(),
            action_required: None,
            timestamp: Utc::now(),
        }
    }

    /// A failing finding.
    pub fn failed(
        category: FindingCategory,
        code: FindingCode,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            severity,
            passed: false,
            message: message.into(),
            action_required: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action_required = Some(action.into());
        self
    }
}

// ---------------------------------------------------------------------------
// SystemHealthSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
    Emergency,
}

impl OverallHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Critical => "critical",
            OverallHealth::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub overall: OverallHealth,
    pub findings: Vec<DetectionFinding>,
    pub summary: String,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealthSnapshot {
    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| !f.passed && f.severity == severity)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Healing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CredentialRotation,
    MockRecovery,
    Restart,
    ProcessCleanup,
    PreventiveMaintenance,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CredentialRotation => "credential_rotation",
            ActionType::MockRecovery => "mock_recovery",
            ActionType::Restart => "restart",
            ActionType::ProcessCleanup => "process_cleanup",
            ActionType::PreventiveMaintenance => "preventive_maintenance",
        }
    }

    /// Added to the severity weight when ordering a plan.
    pub fn type_bonus(self) -> u32 {
        match self {
            ActionType::CredentialRotation => 20,
            ActionType::MockRecovery => 15,
            ActionType::Restart => 10,
            ActionType::ProcessCleanup => 5,
            ActionType::PreventiveMaintenance => 0,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        [
            ActionType::CredentialRotation,
            ActionType::MockRecovery,
            ActionType::Restart,
            ActionType::ProcessCleanup,
            ActionType::PreventiveMaintenance,
        ]
        .into_iter()
        .find(|a| a.as_str() == normalized)
        .ok_or_else(|| format!("unknown action type `{s}`"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingAction {
    pub id: String,
    pub action_type: ActionType,
    pub severity: Severity,
    pub automated: bool,
    pub source: Option<FindingCategory>,
    pub reason: String,
    pub priority: u32,
}

impl HealingAction {
    pub fn new(
        action_type: ActionType,
        severity: Severity,
        source: Option<FindingCategory>,
        reason: impl Into<String>,
    ) -> Self {
        let id = match source {
            Some(category) => format!("{}:{}", action_type.as_str(), category.as_str()),
            None => action_type.as_str().to_string(),
        };
        Self {
            id,
            action_type,
            severity,
            automated: true,
            source,
            reason: reason.into(),
            priority: severity.weight() + action_type.type_bonus(),
        }
    }

    pub fn manual(mut self) -> Self {
        self.automated = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingResult {
    pub action: HealingAction,
    pub success: bool,
    pub duration_ms: u64,
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up_actions: Vec<ActionType>,
    pub error_message: Option<String>,
    /// Retrying cannot fix this; the orchestrator escalates immediately.
    #[serde(default)]
    pub unrecoverable: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DormantModeRecord {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub triggered_by: String,
    pub resume_conditions: Vec<String>,
    pub manual_reset_required: bool,
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// An API credential handed out by the pool.
///
/// The secret never appears in `Debug` output or serialized audit entries.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Stable, non-secret label (e.g. `key-2` or a short fingerprint).
    pub id: String,
    #[serde(skip)]
    pub secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Caller-supplied description of a protected call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub operation: String,
    pub caller: String,
    pub request_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(operation: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            caller: caller.into(),
            request_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    /// Proceed with the attached credential.
    Granted { credential: Option<Credential> },
    /// Not authorized, but a clearly labelled placeholder may be served.
    Fallback { reason: String },
    /// Not authorized; the caller must refuse.
    Denied { reason: String },
}

impl AuthorizationOutcome {
    pub fn source(&self) -> &'static str {
        match self {
            AuthorizationOutcome::Granted { .. } => "granted",
            AuthorizationOutcome::Fallback { .. } => "fallback",
            AuthorizationOutcome::Denied { .. } => "denied",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            AuthorizationOutcome::Granted { .. } => None,
            AuthorizationOutcome::Fallback { reason } | AuthorizationOutcome::Denied { reason } => {
                Some(reason)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub authorized: bool,
    pub execution_id: Uuid,
    pub outcome: AuthorizationOutcome,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_kebab_and_snake() {
        assert_eq!(
            "credential-pool".parse::<FindingCategory>().unwrap(),
            FindingCategory::CredentialPool
        );
        assert_eq!(
            "MOCK_USAGE".parse::<FindingCategory>().unwrap(),
            FindingCategory::MockUsage
        );
        assert!("network".parse::<FindingCategory>().is_err());
    }

    #[test]
    fn action_priority_combines_severity_and_type() {
        let rotation = HealingAction::new(
            ActionType::CredentialRotation,
            Severity::Emergency,
            Some(FindingCategory::CredentialPool),
            "no keys",
        );
        assert_eq!(rotation.priority, 120);
        assert_eq!(rotation.id, "credential_rotation:credential_pool");

        let maintenance =
            HealingAction::new(ActionType::PreventiveMaintenance, Severity::Warning, None, "warnings");
        assert_eq!(maintenance.priority, 25);
        assert_eq!(maintenance.id, "preventive_maintenance");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::new("key-1", "sk-very-secret");
        let rendered = format!("{cred:?}");
        assert!(rendered.contains("key-1"));
        assert!(!rendered.contains("sk-very-secret"));

        let json = serde_json::to_string(&cred).unwrap();
        assert!(!json.contains("sk-very-secret"));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Emergency > Severity::Critical);
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Critical.is_alert());
        assert!(!Severity::Warning.is_alert());
    }
}
