use anyhow::{anyhow, Context, Result};
use kite_mcp::config::KiteConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interval between health probes while waiting for the callback server
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

const CALLBACK_BIN: &str = "kite-callback";
const MCP_BIN: &str = "kite-mcp";

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub monitor_interval: Duration,
    pub startup_timeout: Duration,
    /// Total time children get between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    pub callback_bin: PathBuf,
    pub mcp_bin: PathBuf,
    pub callback_health_url: String,
}

impl SupervisorConfig {
    /// Build from process environment variables.
    ///
    /// Child binaries default to siblings of the running executable.
    pub fn from_env() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate supervisor executable")?;
        let bin_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_lookup(|name| std::env::var(name).ok(), &bin_dir)
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// The shared Kite configuration is validated here so a broken
    /// environment fails before any child is spawned.
    pub fn from_lookup<F>(lookup: F, bin_dir: &Path) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kite = KiteConfig::from_lookup(&lookup)?;
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let secs = |name: &str, default: u64| -> Result<Duration> {
            let value = match var(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{} must be a whole number of seconds", name))?,
                None => default,
            };
            if value == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
            Ok(Duration::from_secs(value))
        };

        Ok(Self {
            monitor_interval: secs("SUPERVISOR_MONITOR_INTERVAL_SECS", 5)?,
            startup_timeout: secs("SUPERVISOR_STARTUP_TIMEOUT_SECS", 30)?,
            stop_grace: secs("SUPERVISOR_STOP_GRACE_SECS", 5)?,
            callback_bin: var("KITE_CALLBACK_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| bin_dir.join(CALLBACK_BIN)),
            mcp_bin: var("KITE_MCP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| bin_dir.join(MCP_BIN)),
            callback_health_url: kite.callback_health_url(),
        })
    }
}
