use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use warden_core::config::BreakerConfig;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by [`CircuitBreaker::execute`].
///
/// Rejections (`Open`, `PermanentlyOpen`, `HalfOpenSaturated`) mean the
/// operation was never invoked. `Operation` carries the original error from
/// an operation that did run, so callers can still inspect it and pick a
/// fallback.
///
/// # Examples
///
/// ```rust
/// use warden_core::config::BreakerConfig;
/// use warden_harness::circuit_breaker::{BreakerError, CircuitBreaker};
///
/// async fn call_remote() {
///     let breaker = CircuitBreaker::new("remote-api", BreakerConfig::default());
///
///     match breaker.execute(|| async { Ok::<_, String>("result") }).await {
///         Err(BreakerError::Open { retry_after, .. }) => {
///             println!("circuit open, retry in {:?}", retry_after);
///         }
///         Err(BreakerError::PermanentlyOpen { reason, .. }) => {
///             println!("manual reset required: {}", reason);
///         }
///         Err(BreakerError::HalfOpenSaturated { .. }) => {}
///         Err(BreakerError::Operation(e)) => println!("call failed: {}", e),
///         Ok(_) => {}
///     }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Too many recent failures; calls are refused until the timeout elapses.
    #[error("circuit `{name}` is open – retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// Terminal state. Only `reset(true)` brings the circuit back.
    #[error("circuit `{name}` is permanently open ({reason}) – manual reset required")]
    PermanentlyOpen { name: String, reason: String },

    /// Half-open and the probe budget is already spent.
    #[error("circuit `{name}` is half-open and not accepting more probes")]
    HalfOpenSaturated { name: String },

    /// The operation ran and failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker refused the call without invoking it.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Operation(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Why admission refused a call, before it is typed for the caller.
enum Rejection {
    Open(Duration),
    Permanent(String),
    Saturated,
}

impl Rejection {
    fn into_error<E>(self, name: &str) -> BreakerError<E> {
        let name = name.to_string();
        match self {
            Rejection::Open(retry_after) => BreakerError::Open { name, retry_after },
            Rejection::Permanent(reason) => BreakerError::PermanentlyOpen { name, reason },
            Rejection::Saturated => BreakerError::HalfOpenSaturated { name },
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation – all calls pass through.
    Closed,
    /// Too many failures – calls are rejected until the timeout elapses.
    Open,
    /// Testing recovery – a limited number of probes are allowed through.
    HalfOpen,
    /// Terminal – every call is rejected until a forced reset.
    PermanentOpen,
}

/// Point-in-time view of a breaker, safe to hand to outer layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub permanent_open_reason: Option<String>,
}

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    permanent_open_reason: Option<String>,
}

impl InnerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
            permanent_open_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// A named breaker. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<BreakerConfig>,
    inner: Arc<Mutex<InnerState>>,
    /// HalfOpen calls admitted but not yet finished.
    in_flight: Arc<AtomicU32>,
}

/// Holds one HalfOpen slot until the admitted call finishes or is dropped.
struct TrialSlot(Arc<AtomicU32>);

impl Drop for TrialSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, mut config: BreakerConfig) -> Self {
        config.permanent_open_patterns = config
            .permanent_open_patterns
            .iter()
            .map(|p| p.to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(InnerState::closed())),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state of the circuit breaker.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Returns the current failure count.
    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    /// Returns the current success count (relevant in half-open).
    pub async fn success_count(&self) -> u32 {
        self.inner.lock().await.success_count
    }

    pub async fn is_permanently_open(&self) -> bool {
        self.state().await == CircuitState::PermanentOpen
    }

    pub async fn status(&self) -> CircuitStatus {
        let guard = self.inner.lock().await;
        CircuitStatus {
            name: self.name.to_string(),
            state: guard.state,
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            last_failure_time: guard.last_failure_at,
            permanent_open_reason: guard.permanent_open_reason.clone(),
        }
    }

    /// Execute `op` through the circuit breaker.
    ///
    /// A permanently open circuit never invokes `op`. An open circuit whose
    /// timeout has elapsed moves to **HalfOpen** and lets the call through;
    /// otherwise the call is rejected with the remaining wait. While
    /// HalfOpen, at most `half_open_max_attempts` calls (finished successes
    /// plus calls still running) are let through; the rest are rejected.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let _slot = self
            .admit()
            .await
            .map_err(|rejection| rejection.into_error(&self.name))?;

        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&e.to_string()).await;
                Err(BreakerError::Operation(e))
            }
        }
    }

    async fn admit(&self) -> Result<Option<TrialSlot>, Rejection> {
        let mut guard = self.inner.lock().await;
        match guard.state {
            CircuitState::PermanentOpen => Err(Rejection::Permanent(
                guard
                    .permanent_open_reason
                    .clone()
                    .unwrap_or_else(|| "permanently open".to_string()),
            )),
            CircuitState::Open => {
                let elapsed = guard
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.timeout() {
                    info!(breaker = %self.name, "circuit breaker transitioning Open -> HalfOpen");
                    guard.state = CircuitState::HalfOpen;
                    guard.success_count = 0;
                    Ok(Some(self.take_slot()))
                } else {
                    Err(Rejection::Open(
                        self.config.timeout().saturating_sub(elapsed),
                    ))
                }
            }
            CircuitState::HalfOpen => {
                let admitted = guard.success_count + self.in_flight.load(Ordering::SeqCst);
                if admitted >= self.config.half_open_max_attempts {
                    Err(Rejection::Saturated)
                } else {
                    Ok(Some(self.take_slot()))
                }
            }
            CircuitState::Closed => Ok(None),
        }
    }

    fn take_slot(&self) -> TrialSlot {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TrialSlot(self.in_flight.clone())
    }

    /// Record a successful call.
    pub async fn on_success(&self) {
        let mut guard = self.inner.lock().await;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.half_open_max_attempts {
                    info!(breaker = %self.name, "circuit breaker transitioning HalfOpen -> Closed");
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.success_count = 0;
                }
            }
            CircuitState::Closed => {
                // No decay: one success clears the streak.
                guard.failure_count = 0;
            }
            CircuitState::Open | CircuitState::PermanentOpen => {}
        }
    }

    /// Record a failed call with its error message.
    pub async fn on_failure(&self, error: &str) {
        let mut guard = self.inner.lock().await;
        guard.failure_count += 1;
        guard.last_failure = Some(Instant::now());
        guard.last_failure_at = Some(Utc::now());

        if guard.state == CircuitState::PermanentOpen {
            return;
        }

        if let Some(reason) = self.permanent_open_reason(guard.failure_count, error) {
            error!(
                breaker = %self.name,
                failures = guard.failure_count,
                reason = %reason,
                "circuit breaker PERMANENTLY OPEN – manual reset required"
            );
            guard.state = CircuitState::PermanentOpen;
            guard.success_count = 0;
            guard.permanent_open_reason = Some(reason);
            return;
        }

        if guard.failure_count >= self.config.failure_threshold && guard.state != CircuitState::Open
        {
            warn!(
                breaker = %self.name,
                failures = guard.failure_count,
                from = ?guard.state,
                "circuit breaker transitioning to Open"
            );
            guard.state = CircuitState::Open;
            guard.success_count = 0;
        }
    }

    fn permanent_open_reason(&self, failures: u32, error: &str) -> Option<String> {
        if failures >= self.config.permanent_open_threshold {
            return Some(format!(
                "{failures} failures reached the permanent-open threshold of {}",
                self.config.permanent_open_threshold
            ));
        }
        let lowered = error.to_lowercase();
        self.config
            .permanent_open_patterns
            .iter()
            .find(|pattern| lowered.contains(pattern.as_str()))
            .map(|pattern| format!("error matched `{pattern}`: {error}"))
    }

    /// Reset to **Closed**. A permanently open circuit only resets when
    /// `force` is set; returns whether the reset happened.
    pub async fn reset(&self, force: bool) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.state == CircuitState::PermanentOpen && !force {
            warn!(
                breaker = %self.name,
                "refusing to reset permanently open circuit without force"
            );
            return false;
        }
        *guard = InnerState::closed();
        info!(breaker = %self.name, force, "circuit breaker reset");
        true
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerRegistry
// ---------------------------------------------------------------------------

/// Process-wide breaker registry. Construct once at start-up and share it;
/// breakers are created lazily by name and live for the process.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Fetch the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        self.get_or_create_with(name, || self.defaults.clone())
    }

    /// Fetch the breaker for `name`, creating it with a specific config.
    /// The config is ignored when the breaker already exists.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: impl FnOnce() -> BreakerConfig,
    ) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config()))
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.value().clone())
    }

    pub fn get_all(&self) -> Vec<CircuitBreaker> {
        let mut all: Vec<CircuitBreaker> = self.breakers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Status of every registered breaker, sorted by name.
    pub async fn get_status(&self) -> Vec<CircuitStatus> {
        let mut statuses = Vec::new();
        for breaker in self.get_all() {
            statuses.push(breaker.status().await);
        }
        statuses
    }

    /// Reset every breaker; returns how many actually reset.
    pub async fn reset_all(&self, force: bool) -> usize {
        let mut reset = 0;
        for breaker in self.get_all() {
            if breaker.reset(force).await {
                reset += 1;
            }
        }
        reset
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
