use anyhow::{Context, Result};
use kite_mcp::api::{create_mcp_router, McpAppState};
use kite_mcp::config::KiteConfig;
use kite_mcp::credentials::open_token_store;
use kite_mcp::shutdown::shutdown_signal;
use kite_mcp::tools::ToolDispatcher;
use kite_mcp::trading::KiteBroker;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kite_mcp=info".into()),
        )
        .init();

    info!("Kite MCP server starting...");

    let config = KiteConfig::from_env().context("Failed to load configuration")?;
    info!(
        api_key = %config.api_key_hint(),
        api_url = %config.api_url,
        port = config.mcp_port,
        headless = config.headless,
        "Configuration loaded"
    );

    let store = open_token_store(&config)?;
    let broker = Arc::new(
        KiteBroker::new(&config.api_url, &config.api_key, config.exchange_timeout)
            .context("Failed to initialize broker client")?,
    );
    let dispatcher = Arc::new(ToolDispatcher::new(&config, store, broker));

    let router = create_mcp_router(McpAppState { dispatcher });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.mcp_port))
        .await
        .context("Failed to bind MCP port")?;
    info!(port = config.mcp_port, "MCP endpoint listening on /mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("MCP server error")?;

    info!("Kite MCP server stopped");
    Ok(())
}
