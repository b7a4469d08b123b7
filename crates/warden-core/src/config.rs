use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.warden/config.toml`.
///
/// **Security**: credentials are never stored here. The `credentials`
/// section only names the environment variable the pool reads its keys from.
///
/// Every toggle is read once when the services are constructed; the only
/// runtime reconfiguration goes through explicit reset/resume operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `$WARDEN_CONFIG` or `~/.warden/config.toml`, falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate("breaker")?;
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_concurrent_tasks must be greater than 0".into(),
            ));
        }
        self.detection.validate()?;
        self.healing.validate()?;
        if self.authority.audit_capacity == 0 {
            return Err(ConfigError::Validation(
                "authority.audit_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Ok(explicit) = std::env::var("WARDEN_CONFIG") {
            return PathBuf::from(explicit);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warden")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful probes in half-open before closing again.
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
    /// How long the circuit stays open before allowing a probe.
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    /// Failures after which the circuit is permanently opened.
    #[serde(default = "default_permanent_open_threshold")]
    pub permanent_open_threshold: u32,
    /// Case-insensitive substrings that permanently open the circuit on sight.
    #[serde(default = "default_permanent_open_patterns")]
    pub permanent_open_patterns: Vec<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            half_open_max_attempts: default_half_open_max_attempts(),
            timeout_ms: default_breaker_timeout_ms(),
            permanent_open_threshold: default_permanent_open_threshold(),
            permanent_open_patterns: default_permanent_open_patterns(),
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 || self.half_open_max_attempts == 0 {
            return Err(ConfigError::Validation(format!(
                "{section}.failure_threshold and {section}.half_open_max_attempts must be greater than 0"
            )));
        }
        if self.permanent_open_threshold < self.failure_threshold {
            return Err(ConfigError::Validation(format!(
                "{section}.permanent_open_threshold ({}) must be >= failure_threshold ({})",
                self.permanent_open_threshold, self.failure_threshold
            )));
        }
        Ok(())
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_half_open_max_attempts() -> u32 {
    3
}
fn default_breaker_timeout_ms() -> u64 {
    60_000
}
fn default_permanent_open_threshold() -> u32 {
    20
}
fn default_permanent_open_patterns() -> Vec<String> {
    vec![
        "invalid api key".into(),
        "api key not valid".into(),
        "permission denied".into(),
        "billing".into(),
    ]
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Register the recurring monitor task at start-up.
    #[serde(default = "default_true")]
    pub monitoring_enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_findings_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_findings_trim_to")]
    pub history_trim_to: usize,
    /// Bypass attempts at which a critical finding is raised.
    #[serde(default = "default_bypass_critical_threshold")]
    pub bypass_critical_threshold: u64,
    /// Placeholder ratio that raises a warning.
    #[serde(default = "default_mock_ratio_warning")]
    pub mock_ratio_warning: f64,
    /// Placeholder ratio that counts as repeated mock usage.
    #[serde(default = "default_mock_ratio_critical")]
    pub mock_ratio_critical: f64,
    /// Ratios are only judged once this many decisions were made.
    #[serde(default = "default_min_decisions_for_ratio")]
    pub min_decisions_for_ratio: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            monitoring_enabled: true,
            monitor_interval_secs: default_monitor_interval_secs(),
            history_capacity: default_findings_capacity(),
            history_trim_to: default_findings_trim_to(),
            bypass_critical_threshold: default_bypass_critical_threshold(),
            mock_ratio_warning: default_mock_ratio_warning(),
            mock_ratio_critical: default_mock_ratio_critical(),
            min_decisions_for_ratio: default_min_decisions_for_ratio(),
        }
    }
}

impl DetectionConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.history_trim_to == 0 || self.history_trim_to > self.history_capacity {
            return Err(ConfigError::Validation(
                "detection.history_trim_to must be in 1..=history_capacity".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.mock_ratio_warning)
            || !(0.0..=1.0).contains(&self.mock_ratio_critical)
            || self.mock_ratio_warning > self.mock_ratio_critical
        {
            return Err(ConfigError::Validation(
                "detection.mock_ratio_warning must be <= mock_ratio_critical, both within 0..=1"
                    .into(),
            ));
        }
        if self.monitor_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "detection.monitor_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_monitor_interval_secs() -> u64 {
    60
}
fn default_findings_capacity() -> usize {
    1000
}
fn default_findings_trim_to() -> usize {
    500
}
fn default_bypass_critical_threshold() -> u64 {
    10
}
fn default_mock_ratio_warning() -> f64 {
    0.2
}
fn default_mock_ratio_critical() -> f64 {
    0.5
}
fn default_min_decisions_for_ratio() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Healing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Consecutive failed passes that send the orchestrator dormant.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,
    #[serde(default = "default_healing_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_healing_history_trim_to")]
    pub history_trim_to: usize,
    /// Breaker guarding the healing pass itself.
    #[serde(default)]
    pub breaker: HealingBreakerConfig,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            periodic_interval_secs: default_periodic_interval_secs(),
            history_capacity: default_healing_history_capacity(),
            history_trim_to: default_healing_history_trim_to(),
            breaker: HealingBreakerConfig::default(),
        }
    }
}

impl HealingConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "healing.base_backoff_ms ({}) must be <= max_backoff_ms ({})",
                self.base_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Validation(
                "healing.max_consecutive_failures must be greater than 0".into(),
            ));
        }
        if self.history_trim_to == 0 || self.history_trim_to > self.history_capacity {
            return Err(ConfigError::Validation(
                "healing.history_trim_to must be in 1..=history_capacity".into(),
            ));
        }
        if self.periodic_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "healing.periodic_interval_secs must be greater than 0".into(),
            ));
        }
        self.breaker.to_breaker_config().validate("healing.breaker")?;
        if self.breaker.failure_threshold <= self.max_consecutive_failures {
            return Err(ConfigError::Validation(format!(
                "healing.breaker.failure_threshold ({}) must be > max_consecutive_failures ({})",
                self.breaker.failure_threshold, self.max_consecutive_failures
            )));
        }
        Ok(())
    }
}

fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_periodic_interval_secs() -> u64 {
    300
}
fn default_healing_history_capacity() -> usize {
    100
}
fn default_healing_history_trim_to() -> usize {
    50
}

/// Breaker settings for the healing pass. Same shape as [`BreakerConfig`]
/// but with its own per-field defaults, so a partial `[healing.breaker]`
/// section never inherits the general thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingBreakerConfig {
    /// Must stay above `healing.max_consecutive_failures`.
    #[serde(default = "default_healing_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_healing_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
    #[serde(default = "default_healing_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_healing_permanent_open_threshold")]
    pub permanent_open_threshold: u32,
    #[serde(default)]
    pub permanent_open_patterns: Vec<String>,
}

impl Default for HealingBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_healing_failure_threshold(),
            half_open_max_attempts: default_healing_half_open_max_attempts(),
            timeout_ms: default_healing_breaker_timeout_ms(),
            permanent_open_threshold: default_healing_permanent_open_threshold(),
            permanent_open_patterns: Vec::new(),
        }
    }
}

impl HealingBreakerConfig {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            half_open_max_attempts: self.half_open_max_attempts,
            timeout_ms: self.timeout_ms,
            permanent_open_threshold: self.permanent_open_threshold,
            permanent_open_patterns: self.permanent_open_patterns.clone(),
        }
    }
}

fn default_healing_failure_threshold() -> u32 {
    15
}
fn default_healing_half_open_max_attempts() -> u32 {
    1
}
fn default_healing_breaker_timeout_ms() -> u64 {
    120_000
}
fn default_healing_permanent_open_threshold() -> u32 {
    30
}

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// When false every request gets a legacy grant (logged loudly).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Strict mode never downgrades a denial into a placeholder fallback.
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    /// Operation names that must always route through the gate.
    #[serde(default = "default_execution_operations")]
    pub execution_operations: Vec<String>,
    /// Substrings in an operation or caller that suggest a bypass attempt.
    #[serde(default = "default_bypass_indicators")]
    pub bypass_indicators: Vec<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strict_mode: false,
            audit_capacity: default_audit_capacity(),
            execution_operations: default_execution_operations(),
            bypass_indicators: default_bypass_indicators(),
        }
    }
}

fn default_audit_capacity() -> usize {
    100
}
fn default_execution_operations() -> Vec<String> {
    ["execute", "generate", "complete", "chat", "embed"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_bypass_indicators() -> Vec<String> {
    ["bypass", "skip_auth", "no_auth", "direct_call", "unguarded", "force_mock"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Credentials / service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Env var holding a comma-separated list of API keys.
    #[serde(default = "default_keys_env")]
    pub keys_env: String,
    /// Failures after which a key is considered exhausted.
    #[serde(default = "default_max_failures_per_key")]
    pub max_failures_per_key: u32,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            keys_env: default_keys_env(),
            max_failures_per_key: default_max_failures_per_key(),
        }
    }
}

fn default_keys_env() -> String {
    "WARDEN_API_KEYS".into()
}
fn default_max_failures_per_key() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_host")]
    pub host: String,
    /// Port the protected service is expected to own.
    #[serde(default = "default_service_port")]
    pub port: u16,
    /// Production deployments imply strict authority mode.
    #[serde(default)]
    pub production: bool,
    /// Whether labelled placeholders may stand in for denied calls.
    #[serde(default)]
    pub allow_mock: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_service_host(),
            port: default_service_port(),
            production: false,
            allow_mock: false,
        }
    }
}

fn default_service_host() -> String {
    "127.0.0.1".into()
}
fn default_service_port() -> u16 {
    9095
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}
