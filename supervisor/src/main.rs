use anyhow::{Context, Result};
use kite_mcp::shutdown::shutdown_signal;
use kite_supervisor::{Supervisor, SupervisorConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kite_supervisor=info".into()),
        )
        .init();

    info!("Kite supervisor starting...");

    let config = SupervisorConfig::from_env().context("Failed to load configuration")?;
    info!(
        callback_bin = %config.callback_bin.display(),
        mcp_bin = %config.mcp_bin.display(),
        health_url = %config.callback_health_url,
        monitor_interval_secs = config.monitor_interval.as_secs(),
        startup_timeout_secs = config.startup_timeout.as_secs(),
        stop_grace_secs = config.stop_grace.as_secs(),
        "Configuration loaded"
    );

    let mut supervisor = Supervisor::from_config(config)?;
    supervisor
        .run(shutdown_signal())
        .await
        .context("Supervisor failed to start servers")?;

    info!("Kite supervisor stopped");
    Ok(())
}
