use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::scheduler::TaskScheduler;

// ---------------------------------------------------------------------------
// ShutdownCoordinator
// ---------------------------------------------------------------------------

/// Releases every scheduled task when the process is asked to stop.
///
/// Long-running loops `subscribe()` and `select!` on the receiver; the
/// coordinator triggers once, on the first of:
/// - an explicit [`trigger`](Self::trigger) call,
/// - Ctrl-C or SIGTERM via [`run_until_signal`](Self::run_until_signal),
/// - the drop of a [`CleanupGuard`] on an early-return or panic path.
///
/// Triggering always runs [`TaskScheduler::cleanup`] before broadcasting.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    scheduler: Arc<TaskScheduler>,
}

impl ShutdownCoordinator {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            scheduler,
        }
    }

    /// Subscribe to the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Release all scheduled tasks and notify subscribers. Only the first
    /// call does anything; returns the number of tasks released.
    pub fn trigger(&self, cause: &str) -> usize {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            warn!(cause, "shutdown already triggered");
            return 0;
        }
        let released = self.scheduler.cleanup();
        info!(cause, released, "shutdown triggered, scheduled tasks released");
        let _ = self.trigger.send(());
        released
    }

    /// Wait for Ctrl-C or SIGTERM, then trigger shutdown.
    pub async fn run_until_signal(&self) {
        let mut rx = self.subscribe();
        tokio::select! {
            signal = wait_for_termination() => {
                self.trigger(signal);
            }
            _ = rx.recv() => {}
        }
    }

    /// A guard that triggers shutdown when dropped.
    pub fn guard(&self) -> CleanupGuard {
        CleanupGuard {
            coordinator: self.clone(),
        }
    }
}

/// Resolves with the name of the first termination signal received.
async fn wait_for_termination() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "ctrl_c",
        _ = terminate => "sigterm",
    }
}

// ---------------------------------------------------------------------------
// CleanupGuard
// ---------------------------------------------------------------------------

/// RAII guard: triggers shutdown (and so scheduler cleanup) on drop, which
/// covers early returns and unwinding out of the main loop.
pub struct CleanupGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.coordinator.trigger("guard_dropped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
