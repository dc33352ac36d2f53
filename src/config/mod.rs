//! Process configuration.
//!
//! Every setting comes from an environment variable. The broker application
//! credentials (`api_key`, `api_secret`, `redirect_url`) may instead live in a
//! TOML file so they do not have to be exported in every shell.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "kite_auth_config.toml";
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080/callback";
pub const DEFAULT_TOKEN_URL: &str = "https://api.kite.trade/session/token";
pub const DEFAULT_API_URL: &str = "https://api.kite.trade";
pub const DEFAULT_LOGIN_URL: &str = "https://kite.zerodha.com/connect/login";
pub const DEFAULT_TOKEN_FILE: &str = "data/kite_tokens.json";
pub const DEFAULT_ORDER_LOG: &str = "logs/order.log";

/// Complete configuration shared by the callback and MCP processes.
#[derive(Debug, Clone)]
pub struct KiteConfig {
    /// Broker application key (identity the session is issued under)
    pub api_key: String,
    /// Broker application secret (only used for the checksum)
    pub api_secret: String,
    /// Redirect URL registered with the broker
    pub redirect_url: String,
    /// Session token exchange endpoint
    pub token_url: String,
    /// Base URL for order and portfolio calls
    pub api_url: String,
    /// Broker login page
    pub login_url: String,
    pub callback_port: u16,
    pub mcp_port: u16,
    /// Redirects cannot reach this host; codes arrive via POST /auth/exchange
    pub headless: bool,
    pub token_file: PathBuf,
    /// When set, credentials live in an encrypted SQLite database instead
    pub token_db: Option<PathBuf>,
    /// Base64-encoded 32-byte key, required with `token_db`
    pub encryption_key: Option<String>,
    pub order_log: PathBuf,
    pub exchange_timeout: Duration,
    /// How long a consumed request token is remembered for duplicate detection
    pub duplicate_window_seconds: i64,
}

/// Optional file-based credentials.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub redirect_url: Option<String>,
}

/// Load the credentials file. A missing file is not an error.
pub fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(Some(config))
}

impl KiteConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let file_path = var("KITE_CONFIG_FILE").unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        let file = load_file_config(Path::new(&file_path))?.unwrap_or_default();

        let api_key = var("KITE_API_KEY").or(file.api_key).ok_or_else(|| {
            anyhow!("KITE_API_KEY is required (environment or {})", file_path)
        })?;
        let api_secret = var("KITE_API_SECRET").or(file.api_secret).ok_or_else(|| {
            anyhow!("KITE_API_SECRET is required (environment or {})", file_path)
        })?;
        let redirect_url = var("KITE_REDIRECT_URL")
            .or(file.redirect_url)
            .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string());

        let headless = parse_var(&var, "KITE_HEADLESS", false)?
            || var("DOCKER_ENV").as_deref() == Some("true");

        let exchange_timeout_secs: u64 = parse_var(&var, "KITE_EXCHANGE_TIMEOUT_SECS", 10)?;
        if exchange_timeout_secs == 0 {
            return Err(anyhow!("KITE_EXCHANGE_TIMEOUT_SECS must be greater than zero"));
        }

        Ok(Self {
            api_key,
            api_secret,
            redirect_url,
            token_url: var("KITE_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            api_url: var("KITE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            login_url: var("KITE_LOGIN_URL").unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            callback_port: parse_var(&var, "CALLBACK_SERVER_PORT", 8080)?,
            mcp_port: parse_var(&var, "MCP_SERVER_PORT", 3000)?,
            headless,
            token_file: var("KITE_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE)),
            token_db: var("KITE_TOKEN_DB").map(PathBuf::from),
            encryption_key: var("KITE_ENCRYPTION_KEY"),
            order_log: var("KITE_ORDER_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ORDER_LOG)),
            exchange_timeout: Duration::from_secs(exchange_timeout_secs),
            duplicate_window_seconds: parse_var(&var, "KITE_DUPLICATE_WINDOW_SECS", 600)?,
        })
    }

    /// Liveness URL of the local callback server.
    pub fn callback_health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.callback_port)
    }

    /// API key prefix that is safe to put in logs.
    pub fn api_key_hint(&self) -> String {
        let prefix: String = self.api_key.chars().take(4).collect();
        format!("{}...", prefix)
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        None => Ok(default),
    }
}
