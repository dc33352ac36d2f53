use anyhow::{Context, Result};
use kite_mcp::api::{create_callback_router, CallbackAppState};
use kite_mcp::auth::{build_login_url, run_code_cleanup, TokenExchanger};
use kite_mcp::config::KiteConfig;
use kite_mcp::credentials::open_token_store;
use kite_mcp::shutdown::shutdown_signal;
use std::sync::Arc;
use tracing::info;

/// How often forgotten request tokens are pruned
const CODE_CLEANUP_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kite_mcp=info,kite_callback=info".into()),
        )
        .init();

    info!("Kite callback server starting...");

    let config = KiteConfig::from_env().context("Failed to load configuration")?;
    info!(
        api_key = %config.api_key_hint(),
        redirect_url = %config.redirect_url,
        port = config.callback_port,
        headless = config.headless,
        "Configuration loaded"
    );

    let store = open_token_store(&config)?;
    let exchanger = Arc::new(TokenExchanger::new(&config, store)?);

    tokio::spawn(run_code_cleanup(
        exchanger.consumed_codes(),
        CODE_CLEANUP_INTERVAL_SECS,
    ));

    let router = create_callback_router(CallbackAppState {
        exchanger,
        headless: config.headless,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.callback_port))
        .await
        .context("Failed to bind callback port")?;
    info!(port = config.callback_port, "Callback server listening on /callback");
    info!(
        "Login URL: {}",
        build_login_url(&config.login_url, &config.api_key, &config.redirect_url)
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Callback server error")?;

    info!("Kite callback server stopped");
    Ok(())
}
