//! Local [`ServiceHost`]: probes the TCP port the protected service expects
//! to own and tracks whether its core has been (re)loaded.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use warden_core::config::ServiceConfig;
use warden_core::providers::{
    CleanupStep, IntegrityReport, IntegrityStatus, ProcessReport, ProviderError, ServiceHost,
};

#[derive(Debug)]
pub struct LocalServiceHost {
    host: String,
    port: u16,
    lock_file: Option<PathBuf>,
    loaded: AtomicBool,
    restarts: AtomicU64,
}

impl LocalServiceHost {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            lock_file: None,
            loaded: AtomicBool::new(true),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn from_config(service: &ServiceConfig) -> Self {
        Self::new(service.host.clone(), service.port)
    }

    /// A lock file removed by the `ClearLocks` cleanup step.
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(path.into());
        self
    }

    /// Record that the service core is no longer loaded; the next integrity
    /// check reports `NotLoaded` until a restart.
    pub fn mark_unloaded(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Whether something else is bound to the service port.
    async fn port_in_use(&self) -> Result<bool, ProviderError> {
        match TcpListener::bind((self.host.as_str(), self.port)).await {
            Ok(listener) => {
                drop(listener);
                Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(true),
            Err(e) => Err(ProviderError::Failed(format!(
                "cannot probe {}:{}: {e}",
                self.host, self.port
            ))),
        }
    }
}

#[async_trait]
impl ServiceHost for LocalServiceHost {
    async fn probe_process(&self) -> Result<ProcessReport, ProviderError> {
        let port_conflict = self.port_in_use().await?;
        let details = if port_conflict {
            format!("port {} is held by another process", self.port)
        } else {
            format!("port {} is free", self.port)
        };
        debug!(port = self.port, port_conflict, "process probe");
        Ok(ProcessReport {
            port: self.port,
            port_conflict,
            stale_processes: 0,
            details,
        })
    }

    async fn cleanup_step(&self, step: CleanupStep) -> Result<String, ProviderError> {
        match step {
            CleanupStep::ReapStaleProcesses => Ok("no stale processes tracked".to_string()),
            CleanupStep::ReleasePort => {
                if self.port_in_use().await? {
                    Err(ProviderError::Failed(format!(
                        "port {} is held by a process this host does not own",
                        self.port
                    )))
                } else {
                    Ok(format!("port {} is free", self.port))
                }
            }
            CleanupStep::ClearLocks => {
                let Some(path) = &self.lock_file else {
                    return Ok("no lock file configured".to_string());
                };
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "stale lock file removed");
                        Ok(format!("removed {}", path.display()))
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        Ok(format!("{} not present", path.display()))
                    }
                    Err(e) => Err(ProviderError::Failed(format!(
                        "cannot remove {}: {e}",
                        path.display()
                    ))),
                }
            }
        }
    }

    async fn restart(&self) -> Result<(), ProviderError> {
        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        self.loaded.store(true, Ordering::SeqCst);
        warn!(restarts, "protected service restarted");
        Ok(())
    }

    async fn check_integrity(&self) -> Result<IntegrityReport, ProviderError> {
        Ok(if self.loaded.load(Ordering::SeqCst) {
            IntegrityReport {
                status: IntegrityStatus::Healthy,
                message: "service core loaded".to_string(),
            }
        } else {
            IntegrityReport {
                status: IntegrityStatus::NotLoaded,
                message: "service core is not loaded".to_string(),
            }
        })
    }
}
