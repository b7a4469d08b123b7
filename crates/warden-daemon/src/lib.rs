//! The warden reliability daemon.
//!
//! Wires the execution authority gate, the health detection engine, and the
//! self-healing orchestrator on top of the shared scheduler and breaker
//! registry from `warden-harness`:
//! - `authority`: grant / fallback / deny decisions before protected calls
//! - `detection`: periodic health checks, severity aggregation, alerts
//! - `healing`: alert-driven and periodic remediation with Dormant Mode
//! - `host`: the local service host used by the binary
//! - `daemon`: construction, start-up, shutdown, and the operator surface

pub mod authority;
pub mod daemon;
pub mod detection;
pub mod healing;
pub mod host;
