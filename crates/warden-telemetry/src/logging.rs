use tracing_subscriber::{fmt, EnvFilter};
use warden_core::config::{LogFormat, LoggingConfig};

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` wins over `config.level` when set. Safe to call more than once
/// (tests, embedding hosts); later calls are no-ops. Returns whether this
/// call installed the subscriber.
pub fn init_logging(service_name: &str, config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, format = ?config.format, "logging initialised");
    }
    installed
}

/// Subscriber for tests: captured by the test harness, debug level.
pub fn init_test_logging() {
    fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init()
        .ok();
}
