use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_core::config::AuthorityConfig;
use warden_core::providers::{CredentialPool, EnvironmentPolicy, SystemStatusProvider};
use warden_core::types::{AuthorizationDecision, AuthorizationOutcome, Credential, ExecutionContext};
use warden_telemetry::metrics::{names, MetricsCollector};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorityStats {
    pub enabled: bool,
    pub strict_mode: bool,
    pub total: u64,
    /// Includes legacy grants.
    pub granted: u64,
    pub denied: u64,
    pub fallback: u64,
    pub legacy: u64,
    pub bypass_attempts: u64,
}

impl AuthorityStats {
    pub fn denial_ratio(&self) -> f64 {
        ratio(self.denied, self.total)
    }

    pub fn fallback_ratio(&self) -> f64 {
        ratio(self.fallback, self.total)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    fallback: AtomicU64,
    legacy: AtomicU64,
    bypass: AtomicU64,
}

/// Why the gate refused. Soft denials may be downgraded to a fallback.
enum Refusal {
    Hard(String),
    Soft(String),
}

// ---------------------------------------------------------------------------
// ExecutionAuthority
// ---------------------------------------------------------------------------

/// The single gate consulted before every protected external call.
///
/// Checks run in order and stop at the first failure: administrative
/// toggle, request context, system status, credential availability,
/// environment policy. Every decision is kept in a bounded audit ring.
pub struct ExecutionAuthority {
    config: AuthorityConfig,
    credentials: Arc<dyn CredentialPool>,
    status: Arc<dyn SystemStatusProvider>,
    policy: Arc<dyn EnvironmentPolicy>,
    metrics: Option<Arc<MetricsCollector>>,
    bypass_indicators: Vec<String>,
    counters: Counters,
    audit: Mutex<VecDeque<AuthorizationDecision>>,
}

impl std::fmt::Debug for ExecutionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionAuthority")
            .field("enabled", &self.config.enabled)
            .field("strict_mode", &self.config.strict_mode)
            .finish_non_exhaustive()
    }
}

impl ExecutionAuthority {
    pub fn new(
        config: AuthorityConfig,
        credentials: Arc<dyn CredentialPool>,
        status: Arc<dyn SystemStatusProvider>,
        policy: Arc<dyn EnvironmentPolicy>,
    ) -> Self {
        let bypass_indicators = config
            .bypass_indicators
            .iter()
            .map(|s| s.to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !config.enabled {
            warn!("execution authority is DISABLED; every call will receive a legacy grant");
        }
        Self {
            audit: Mutex::new(VecDeque::with_capacity(config.audit_capacity)),
            config,
            credentials,
            status,
            policy,
            metrics: None,
            bypass_indicators,
            counters: Counters::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide whether `context` may perform a protected call.
    pub async fn authorize_execution(&self, context: &ExecutionContext) -> AuthorizationDecision {
        let execution_id = Uuid::new_v4();
        let mut metadata = BTreeMap::new();
        metadata.insert("operation".to_string(), context.operation.clone());
        metadata.insert("caller".to_string(), context.caller.clone());
        if let Some(request_id) = &context.request_id {
            metadata.insert("request_id".to_string(), request_id.clone());
        }

        let outcome = if !self.config.enabled {
            error!(
                %execution_id,
                operation = %context.operation,
                caller = %context.caller,
                "LEGACY AUTHORIZATION: execution authority disabled, granting without checks"
            );
            metadata.insert("mode".to_string(), "legacy".to_string());
            self.counters.legacy.fetch_add(1, Ordering::Relaxed);
            AuthorizationOutcome::Granted {
                credential: self.credentials.current_key().await,
            }
        } else {
            match self.evaluate(context, &mut metadata).await {
                Ok(credential) => AuthorizationOutcome::Granted {
                    credential: Some(credential),
                },
                Err(Refusal::Hard(reason)) => AuthorizationOutcome::Denied { reason },
                Err(Refusal::Soft(reason)) => {
                    if self.fallback_allowed().await {
                        AuthorizationOutcome::Fallback { reason }
                    } else {
                        AuthorizationOutcome::Denied { reason }
                    }
                }
            }
        };

        if let AuthorizationOutcome::Granted {
            credential: Some(credential),
        } = &outcome
        {
            metadata.insert("credential".to_string(), credential.id.clone());
        }

        let decision = AuthorizationDecision {
            authorized: matches!(outcome, AuthorizationOutcome::Granted { .. }),
            execution_id,
            outcome,
            metadata,
            timestamp: Utc::now(),
        };
        self.record(&decision);
        decision
    }

    async fn evaluate(
        &self,
        context: &ExecutionContext,
        metadata: &mut BTreeMap<String, String>,
    ) -> Result<Credential, Refusal> {
        if context.operation.trim().is_empty() {
            return Err(Refusal::Hard("execution context is missing `operation`".into()));
        }
        if context.caller.trim().is_empty() {
            return Err(Refusal::Hard("execution context is missing `caller`".into()));
        }

        match self.status.status().await {
            Ok(status) if status.can_serve_requests => {}
            Ok(status) => {
                return Err(Refusal::Soft(format!(
                    "system cannot serve requests: {}",
                    status.message
                )))
            }
            Err(e) => return Err(Refusal::Soft(format!("system status unavailable: {e}"))),
        }

        let Some(credential) = self.credentials.current_key().await else {
            return Err(Refusal::Soft("no API credentials available".into()));
        };

        match self.policy.policy().await {
            Ok(report) => {
                if let Some(violation) = report.critical_violation {
                    return Err(Refusal::Hard(format!("environment policy violation: {violation}")));
                }
                if !report.warnings.is_empty() {
                    metadata.insert("policy_warnings".to_string(), report.warnings.join("; "));
                }
            }
            Err(e) => return Err(Refusal::Hard(format!("environment policy unavailable: {e}"))),
        }

        Ok(credential)
    }

    /// Placeholders are only ever served outside strict mode and when the
    /// environment policy allows them.
    async fn fallback_allowed(&self) -> bool {
        if self.config.strict_mode {
            return false;
        }
        match self.policy.policy().await {
            Ok(report) => report.allow_mock && !report.strict_mode && report.critical_violation.is_none(),
            Err(_) => false,
        }
    }

    fn record(&self, decision: &AuthorizationDecision) {
        let counters = &self.counters;
        counters.total.fetch_add(1, Ordering::Relaxed);
        match &decision.outcome {
            AuthorizationOutcome::Granted { .. } => {
                counters.granted.fetch_add(1, Ordering::Relaxed);
                debug!(execution_id = %decision.execution_id, "execution authorized");
            }
            AuthorizationOutcome::Fallback { reason } => {
                counters.fallback.fetch_add(1, Ordering::Relaxed);
                warn!(execution_id = %decision.execution_id, %reason, "execution downgraded to placeholder");
            }
            AuthorizationOutcome::Denied { reason } => {
                counters.denied.fetch_add(1, Ordering::Relaxed);
                warn!(execution_id = %decision.execution_id, %reason, "execution denied");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                names::AUTHORIZATION_DECISIONS,
                &[("source", decision.outcome.source())],
            );
        }

        let mut audit = self.audit.lock().unwrap_or_else(|p| p.into_inner());
        while audit.len() >= self.config.audit_capacity.max(1) {
            audit.pop_front();
        }
        audit.push_back(decision.clone());
    }

    /// Count a call that looks like it tried to dodge the gate. Returns the
    /// indicator that matched, if any.
    pub fn detect_bypass(&self, context: &ExecutionContext) -> Option<String> {
        let operation = context.operation.to_lowercase();
        let caller = context.caller.to_lowercase();
        let indicator = self
            .bypass_indicators
            .iter()
            .find(|i| operation.contains(i.as_str()) || caller.contains(i.as_str()))?
            .clone();
        self.record_bypass_attempt(&context.operation, &indicator);
        Some(indicator)
    }

    pub fn record_bypass_attempt(&self, operation: &str, detail: &str) {
        let attempts = self.counters.bypass.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(operation, detail, attempts, "possible authority bypass attempt");
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(names::BYPASS_ATTEMPTS, &[]);
        }
    }

    /// Whether `operation` is a protected execution that must use the gate.
    pub fn is_execution_operation(&self, operation: &str) -> bool {
        self.config
            .execution_operations
            .iter()
            .any(|op| op.eq_ignore_ascii_case(operation))
    }

    pub async fn record_credential_outcome(&self, credential: &Credential, error: Option<&str>) {
        match error {
            None => self.credentials.record_success(credential).await,
            Some(e) => self.credentials.record_failure(credential, e).await,
        }
    }

    pub fn stats(&self) -> AuthorityStats {
        let c = &self.counters;
        AuthorityStats {
            enabled: self.config.enabled,
            strict_mode: self.config.strict_mode,
            total: c.total.load(Ordering::Relaxed),
            granted: c.granted.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            fallback: c.fallback.load(Ordering::Relaxed),
            legacy: c.legacy.load(Ordering::Relaxed),
            bypass_attempts: c.bypass.load(Ordering::Relaxed),
        }
    }

    /// The most recent `limit` decisions, oldest first.
    pub fn recent_decisions(&self, limit: usize) -> Vec<AuthorizationDecision> {
        let audit = self.audit.lock().unwrap_or_else(|p| p.into_inner());
        let skip = audit.len().saturating_sub(limit);
        audit.iter().skip(skip).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// GuardedExecutor
// ---------------------------------------------------------------------------

/// Returned instead of a live result when the gate allows a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPlaceholder {
    pub execution_id: Uuid,
    pub operation: String,
    pub reason: String,
    /// Always present so no placeholder can pass for a real response.
    pub label: String,
    pub generated_at: DateTime<Utc>,
}

impl FallbackPlaceholder {
    fn new(execution_id: Uuid, operation: &str, reason: &str) -> Self {
        Self {
            execution_id,
            operation: operation.to_string(),
            reason: reason.to_string(),
            label: format!("[PLACEHOLDER] `{operation}` was not executed: {reason}"),
            generated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    Live(T),
    Placeholder(FallbackPlaceholder),
}

impl<T> Guarded<T> {
    pub fn is_live(&self) -> bool {
        matches!(self, Guarded::Live(_))
    }

    pub fn live(self) -> Option<T> {
        match self {
            Guarded::Live(value) => Some(value),
            Guarded::Placeholder(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("execution {execution_id} denied: {reason}")]
pub struct AuthorizationDenied {
    pub execution_id: Uuid,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    Denied(#[from] AuthorizationDenied),
    #[error("{0}")]
    Operation(E),
}

/// Decorator placed in front of protected calls.
///
/// Execution operations go through [`ExecutionAuthority::authorize_execution`]
/// before `op` runs; a denied call never invokes `op`. Other operations pass
/// straight through. Either way the context is screened for bypass
/// indicators.
#[derive(Debug, Clone)]
pub struct GuardedExecutor {
    authority: Arc<ExecutionAuthority>,
}

impl GuardedExecutor {
    pub fn new(authority: Arc<ExecutionAuthority>) -> Self {
        Self { authority }
    }

    pub fn authority(&self) -> &Arc<ExecutionAuthority> {
        &self.authority
    }

    /// Run `op` behind the gate. `op` receives the granted credential.
    pub async fn run<F, Fut, T, E>(
        &self,
        context: ExecutionContext,
        op: F,
    ) -> Result<Guarded<T>, GuardError<E>>
    where
        F: FnOnce(Option<Credential>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.authority.detect_bypass(&context);

        if !self.authority.is_execution_operation(&context.operation) {
            debug!(operation = %context.operation, "not an execution operation, passing through");
            return op(None).await.map(Guarded::Live).map_err(GuardError::Operation);
        }

        let decision = self.authority.authorize_execution(&context).await;
        match decision.outcome {
            AuthorizationOutcome::Granted { credential } => {
                let result = op(credential.clone()).await;
                if let Some(credential) = &credential {
                    let error = result.as_ref().err().map(|e| e.to_string());
                    self.authority
                        .record_credential_outcome(credential, error.as_deref())
                        .await;
                }
                result.map(Guarded::Live).map_err(GuardError::Operation)
            }
            AuthorizationOutcome::Fallback { reason } => {
                info!(
                    execution_id = %decision.execution_id,
                    operation = %context.operation,
                    "serving labelled placeholder"
                );
                Ok(Guarded::Placeholder(FallbackPlaceholder::new(
                    decision.execution_id,
                    &context.operation,
                    &reason,
                )))
            }
            AuthorizationOutcome::Denied { reason } => Err(AuthorizationDenied {
                execution_id: decision.execution_id,
                reason,
            }
            .into()),
        }
    }
}
