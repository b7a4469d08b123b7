//! warden daemon: loads config, starts health monitoring and self-healing,
//! and runs until Ctrl-C or SIGTERM.

use anyhow::{Context, Result};
use tracing::{info, warn};
use warden_core::config::Config;
use warden_daemon::daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging needs the config, so a load failure is reported after init.
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    warden_telemetry::logging::init_logging("warden-daemon", &config.logging);
    if let Some(e) = load_error {
        warn!(error = %e, path = %Config::default_path().display(), "failed to load config, using defaults");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "warden daemon starting"
    );

    let daemon = Daemon::new(config).context("failed to build warden daemon")?;
    daemon.run().await?;

    info!("warden daemon exited");
    Ok(())
}
