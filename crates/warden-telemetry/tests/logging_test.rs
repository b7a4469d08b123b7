use warden_core::config::{LogFormat, LoggingConfig};
use warden_telemetry::logging;

#[test]
fn init_logging_is_idempotent() {
    let config = LoggingConfig::default();
    logging::init_logging("warden-test", &config);
    // The global subscriber is already set, so this one is refused.
    assert!(!logging::init_logging("warden-test", &config));

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn json_format_after_init_is_a_no_op() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Json,
    };
    logging::init_logging("warden-test-json", &config);
    assert!(!logging::init_logging("warden-test-json", &config));

    tracing::info!(key = "value", "json log line");
}

#[test]
fn test_logging_does_not_panic_when_repeated() {
    logging::init_test_logging();
    logging::init_test_logging();
}
