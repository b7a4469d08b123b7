//! External collaborators consumed by the reliability core.
//!
//! The core never talks to the remote API itself. It asks a
//! [`CredentialPool`] for keys, a [`SystemStatusProvider`] whether the
//! service can serve, an [`EnvironmentPolicy`] what the deployment allows,
//! and a [`ServiceHost`] about the local process. The reference
//! implementations here are what the daemon binary wires by default.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CredentialsConfig, ServiceConfig};
use crate::types::Credential;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider failed: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Credential pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub exhausted: usize,
    /// Label of the credential currently selected, if any.
    pub current: Option<String>,
}

#[async_trait]
pub trait CredentialPool: Send + Sync {
    /// The credential callers should use next, or `None` if none is active.
    async fn current_key(&self) -> Option<Credential>;

    async fn stats(&self) -> PoolStats;

    async fn has_available_keys(&self) -> bool {
        self.stats().await.active > 0
    }

    /// Move selection to the next active credential.
    async fn rotate(&self) -> Option<Credential> {
        self.current_key().await
    }

    async fn record_success(&self, key: &Credential);

    async fn record_failure(&self, key: &Credential, error: &str);
}

#[derive(Debug)]
struct KeySlot {
    credential: Credential,
    failures: u32,
    exhausted: bool,
}

#[derive(Debug, Default)]
struct PoolInner {
    slots: Vec<KeySlot>,
    cursor: usize,
}

impl PoolInner {
    /// First active slot at or after the cursor, wrapping around.
    fn next_active_from(&self, start: usize) -> Option<usize> {
        let len = self.slots.len();
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !self.slots[idx].exhausted)
    }
}

/// Credential pool backed by a comma-separated list of keys.
///
/// Keys are labelled `key-1`, `key-2`, ... in the order given. A key that
/// fails `max_failures` times in a row is marked exhausted and skipped.
#[derive(Debug)]
pub struct EnvCredentialPool {
    inner: Mutex<PoolInner>,
    max_failures: u32,
}

impl EnvCredentialPool {
    pub fn new(keys: Vec<String>, max_failures: u32) -> Self {
        let slots = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(idx, secret)| KeySlot {
                credential: Credential::new(format!("key-{}", idx + 1), secret),
                failures: 0,
                exhausted: false,
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner { slots, cursor: 0 }),
            max_failures: max_failures.max(1),
        }
    }

    /// Read keys from the env var named in config. A missing variable yields
    /// an empty pool, which the detection engine reports as an emergency.
    pub fn from_env(config: &CredentialsConfig) -> Self {
        let raw = std::env::var(&config.keys_env).unwrap_or_default();
        let keys: Vec<String> = raw.split(',').map(str::to_string).collect();
        let pool = Self::new(keys, config.max_failures_per_key);
        let total = pool.lock().slots.len();
        if total == 0 {
            warn!(env = %config.keys_env, "no credentials found in environment");
        } else {
            info!(env = %config.keys_env, total, "credential pool loaded");
        }
        pool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CredentialPool for EnvCredentialPool {
    async fn current_key(&self) -> Option<Credential> {
        let mut inner = self.lock();
        if inner.slots.is_empty() {
            return None;
        }
        let idx = inner.next_active_from(inner.cursor)?;
        inner.cursor = idx;
        Some(inner.slots[idx].credential.clone())
    }

    async fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let exhausted = inner.slots.iter().filter(|s| s.exhausted).count();
        let current = if inner.slots.is_empty() {
            None
        } else {
            inner
                .next_active_from(inner.cursor)
                .map(|idx| inner.slots[idx].credential.id.clone())
        };
        PoolStats {
            total: inner.slots.len(),
            active: inner.slots.len() - exhausted,
            exhausted,
            current,
        }
    }

    async fn rotate(&self) -> Option<Credential> {
        let mut inner = self.lock();
        if inner.slots.is_empty() {
            return None;
        }
        let start = (inner.cursor + 1) % inner.slots.len();
        let idx = inner.next_active_from(start)?;
        inner.cursor = idx;
        debug!(key = %inner.slots[idx].credential.id, "credential rotated");
        Some(inner.slots[idx].credential.clone())
    }

    async fn record_success(&self, key: &Credential) {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.credential.id == key.id) {
            slot.failures = 0;
        }
    }

    async fn record_failure(&self, key: &Credential, error: &str) {
        let max_failures = self.max_failures;
        let mut inner = self.lock();
        let Some(idx) = inner.slots.iter().position(|s| s.credential.id == key.id) else {
            return;
        };
        let slot = &mut inner.slots[idx];
        slot.failures += 1;
        if slot.failures >= max_failures && !slot.exhausted {
            slot.exhausted = true;
            warn!(key = %slot.credential.id, failures = slot.failures, error, "credential exhausted");
            if inner.cursor == idx && !inner.slots.is_empty() {
                inner.cursor = (idx + 1) % inner.slots.len();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// System status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub can_serve_requests: bool,
    pub message: String,
}

#[async_trait]
pub trait SystemStatusProvider: Send + Sync {
    async fn status(&self) -> Result<SystemStatus, ProviderError>;
}

/// A status provider whose answer is set by the host application.
#[derive(Debug)]
pub struct StaticSystemStatus {
    status: Mutex<SystemStatus>,
}

impl StaticSystemStatus {
    pub fn serving() -> Self {
        Self::new(true, "ready")
    }

    pub fn new(can_serve_requests: bool, message: impl Into<String>) -> Self {
        Self {
            status: Mutex::new(SystemStatus {
                can_serve_requests,
                message: message.into(),
            }),
        }
    }

    pub fn set(&self, can_serve_requests: bool, message: impl Into<String>) {
        let mut guard = self.status.lock().unwrap_or_else(|p| p.into_inner());
        guard.can_serve_requests = can_serve_requests;
        guard.message = message.into();
    }
}

#[async_trait]
impl SystemStatusProvider for StaticSystemStatus {
    async fn status(&self) -> Result<SystemStatus, ProviderError> {
        Ok(self.status.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

// ---------------------------------------------------------------------------
// Environment policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReport {
    pub allow_mock: bool,
    pub strict_mode: bool,
    pub warnings: Vec<String>,
    /// A violation serious enough to deny every protected call.
    pub critical_violation: Option<String>,
}

#[async_trait]
pub trait EnvironmentPolicy: Send + Sync {
    async fn policy(&self) -> Result<PolicyReport, ProviderError>;
}

/// Policy derived from the service section of the config.
#[derive(Debug, Clone)]
pub struct ConfigPolicy {
    production: bool,
    allow_mock: bool,
}

impl ConfigPolicy {
    pub fn from_config(service: &ServiceConfig) -> Self {
        Self {
            production: service.production,
            allow_mock: service.allow_mock,
        }
    }
}

#[async_trait]
impl EnvironmentPolicy for ConfigPolicy {
    async fn policy(&self) -> Result<PolicyReport, ProviderError> {
        let mut warnings = Vec::new();
        let mut critical_violation = None;
        if self.production && self.allow_mock {
            critical_violation =
                Some("placeholder responses are enabled in a production deployment".to_string());
        } else if self.allow_mock {
            warnings.push("placeholder responses are enabled".to_string());
        }
        Ok(PolicyReport {
            allow_mock: self.allow_mock && !self.production,
            strict_mode: self.production,
            warnings,
            critical_violation,
        })
    }
}

// ---------------------------------------------------------------------------
// Service host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub port: u16,
    /// Another process holds the port the service expects to own.
    pub port_conflict: bool,
    pub stale_processes: usize,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    ReapStaleProcesses,
    ReleasePort,
    ClearLocks,
}

impl CleanupStep {
    pub const ALL: [CleanupStep; 3] = [
        CleanupStep::ReapStaleProcesses,
        CleanupStep::ReleasePort,
        CleanupStep::ClearLocks,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Healthy,
    Degraded,
    NotLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub message: String,
}

/// The local process hosting the protected service.
#[async_trait]
pub trait ServiceHost: Send + Sync {
    async fn probe_process(&self) -> Result<ProcessReport, ProviderError>;

    async fn cleanup_step(&self, step: CleanupStep) -> Result<String, ProviderError>;

    /// Restart the protected service in-process.
    async fn restart(&self) -> Result<(), ProviderError>;

    async fn check_integrity(&self) -> Result<IntegrityReport, ProviderError>;
}
