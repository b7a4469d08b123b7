//! Shared vocabulary for the warden reliability subsystem.
//!
//! - [`config`]: TOML configuration with per-component sections
//! - [`types`]: findings, snapshots, healing and authorization records
//! - [`providers`]: traits for the external collaborators (credential pool,
//!   system status, environment policy, service host) plus reference
//!   implementations used by the daemon binary

pub mod config;
pub mod providers;
pub mod types;
