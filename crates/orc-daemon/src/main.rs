//! coderd — loads config, opens the job database, and runs the dispatch
//! loop until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use orc_core::config::Config;
use orc_daemon::daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });

    if config.general.log_format == "json" {
        orc_telemetry::logging::init_logging_json("coderd", &config.general.log_level);
    } else {
        orc_telemetry::logging::init_logging("coderd", &config.general.log_level);
    }

    info!(
        max_concurrent_jobs = config.daemon.max_concurrent_jobs,
        coder_cli_bin = %config.daemon.coder_cli_bin,
        "coderd starting"
    );

    let db_path = Config::default_path()
        .parent()
        .map(|p| p.join("coderd.sqlite3"))
        .context("failed to resolve database path")?;

    let daemon = Daemon::new(&config, &db_path).await?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install sigterm handler");
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("ctrl-c received, initiating shutdown");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, initiating shutdown");
            }
        }
        shutdown.trigger();
    });

    daemon.run().await;
    Ok(())
}
