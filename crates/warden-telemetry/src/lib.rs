//! Observability for the warden services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   selected by the `[logging]` config section.
//! - **Metrics**: labelled counters, gauges, and duration histograms with
//!   Prometheus and JSON export.

pub mod logging;
pub mod metrics;
