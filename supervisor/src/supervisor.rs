use crate::config::{SupervisorConfig, HEALTH_POLL_INTERVAL};
use crate::health::{probe, probe_client, wait_healthy};
use crate::process::{ManagedProcess, ProcessSpec, ProcessState};
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use std::future::Future;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

/// Keeps the callback server and the MCP server running side by side.
pub struct Supervisor {
    config: SupervisorConfig,
    callback: ManagedProcess,
    mcp: ManagedProcess,
    client: Client,
}

impl Supervisor {
    /// Supervisor for the two shipped binaries.
    pub fn from_config(config: SupervisorConfig) -> Result<Self> {
        let callback = ProcessSpec::new("callback", config.callback_bin.clone())
            .health_url(config.callback_health_url.clone());
        let mcp = ProcessSpec::new("mcp", config.mcp_bin.clone());
        Self::new(config, callback, mcp)
    }

    /// # Arguments
    /// * `callback` - Started first; must pass its health probe before `mcp` starts
    /// * `mcp` - Started once `callback` is healthy; checked for liveness only
    pub fn new(config: SupervisorConfig, callback: ProcessSpec, mcp: ProcessSpec) -> Result<Self> {
        Ok(Self {
            config,
            callback: ManagedProcess::new(callback),
            mcp: ManagedProcess::new(mcp),
            client: probe_client().context("Failed to build health probe client")?,
        })
    }

    pub fn callback(&self) -> &ManagedProcess {
        &self.callback
    }

    pub fn mcp(&self) -> &ManagedProcess {
        &self.mcp
    }

    /// Brings both processes up. On failure everything already started is
    /// stopped before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if let Err(e) = self.start_processes().await {
            error!(error = %format!("{:#}", e), "Startup failed");
            self.stop_all().await;
            return Err(e);
        }
        info!(
            callback_pid = self.callback.pid().unwrap_or_default(),
            mcp_pid = self.mcp.pid().unwrap_or_default(),
            "All processes started"
        );
        Ok(())
    }

    async fn start_processes(&mut self) -> Result<()> {
        self.callback.spawn()?;
        match self.callback.spec().health_url.clone() {
            Some(url) => {
                wait_healthy(
                    &self.client,
                    &mut self.callback,
                    &url,
                    self.config.startup_timeout,
                    HEALTH_POLL_INTERVAL,
                )
                .await?
            }
            None => self.callback.mark_healthy(),
        }

        self.mcp.spawn()?;
        if let Some(status) = self.mcp.poll_exit() {
            return Err(anyhow!("{} exited during startup ({})", self.mcp.name(), status));
        }
        if self.mcp.spec().health_url.is_none() {
            self.mcp.mark_healthy();
        }
        Ok(())
    }

    /// One monitoring pass: reap exited children, respawn crashed ones and
    /// promote starting ones that answer their health probe.
    pub async fn monitor_once(&mut self) {
        for process in [&mut self.callback, &mut self.mcp] {
            tend(&self.client, process).await;
        }
    }

    /// Starts both processes, monitors them until `shutdown` resolves, then
    /// stops them.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            result = self.start() => result?,
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                self.stop_all().await;
                return Ok(());
            }
        }

        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping processes");
                    break;
                }
                _ = interval.tick() => self.monitor_once().await,
            }
        }

        self.stop_all().await;
        Ok(())
    }

    /// SIGTERM to every child, then SIGKILL whatever is left once the grace
    /// period (shared by all children) runs out.
    pub async fn stop_all(&mut self) {
        let deadline = Instant::now() + self.config.stop_grace;
        self.mcp.terminate();
        self.callback.terminate();
        self.mcp.wait_or_kill(deadline).await;
        self.callback.wait_or_kill(deadline).await;
        info!("All processes stopped");
    }
}

async fn tend(client: &Client, process: &mut ManagedProcess) {
    if let Some(status) = process.poll_exit() {
        error!(process = %process.name(), status = %status, "Process exited unexpectedly");
    }

    match process.state() {
        ProcessState::Crashed => match process.spawn() {
            Ok(()) => info!(
                process = %process.name(),
                restart_count = process.restart_count,
                "Process restarted"
            ),
            Err(e) => error!(
                process = %process.name(),
                error = %format!("{:#}", e),
                "Restart failed, retrying next interval"
            ),
        },
        ProcessState::Starting => match process.spec().health_url.clone() {
            Some(url) => {
                if probe(client, &url).await {
                    process.mark_healthy();
                }
            }
            None => process.mark_healthy(),
        },
        _ => {}
    }
}
