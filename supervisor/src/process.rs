//! Managed child processes: spawn, liveness, termination.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{info, warn};

/// What to run and how to tell it is healthy.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Polled during startup and after restarts; `None` means liveness only
    pub health_url: Option<String>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            health_url: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Healthy,
    Crashed,
    Stopping,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Healthy => "healthy",
            ProcessState::Crashed => "crashed",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One child process plus its restart bookkeeping.
#[derive(Debug)]
pub struct ManagedProcess {
    spec: ProcessSpec,
    child: Option<Child>,
    state: ProcessState,
    pub last_started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u32,
}

impl ManagedProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: None,
            state: ProcessState::Stopped,
            last_started: None,
            last_error: None,
            restart_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Spawns the child with inherited stdio and environment.
    ///
    /// On failure the process is left `Crashed` with `last_error` set so the
    /// monitor retries it on the next tick.
    pub fn spawn(&mut self) -> Result<()> {
        let result = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.spec.program.display()));

        match result {
            Ok(child) => {
                if self.last_started.is_some() {
                    self.restart_count += 1;
                }
                info!(
                    process = %self.spec.name,
                    pid = child.id().unwrap_or_default(),
                    restart_count = self.restart_count,
                    "Process started"
                );
                self.child = Some(child);
                self.state = ProcessState::Starting;
                self.last_started = Some(Utc::now());
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.child = None;
                self.state = ProcessState::Crashed;
                self.last_error = Some(format!("{:#}", e));
                Err(e)
            }
        }
    }

    /// Non-blocking exit check. Returns the exit status once, when the child
    /// is first seen to have exited, and marks the process `Crashed`.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                self.state = ProcessState::Crashed;
                self.last_error = Some(format!("exited with {}", status));
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(process = %self.spec.name, error = %e, "Failed to poll process status");
                None
            }
        }
    }

    /// True while a child handle exists and has not been reaped.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn mark_healthy(&mut self) {
        if self.state == ProcessState::Starting {
            info!(process = %self.spec.name, "Process healthy");
            self.state = ProcessState::Healthy;
        }
    }

    /// Asks the child to exit (SIGTERM on unix).
    pub fn terminate(&mut self) {
        let Some(child) = self.child.as_mut() else {
            self.state = ProcessState::Stopped;
            return;
        };
        self.state = ProcessState::Stopping;
        info!(process = %self.spec.name, pid = child.id().unwrap_or_default(), "Stopping process");
        send_terminate(child);
    }

    /// Waits for the child until `deadline`, then kills it.
    pub async fn wait_or_kill(&mut self, deadline: Instant) {
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(process = %self.spec.name, status = %status, "Process stopped");
                }
                Ok(Err(e)) => {
                    warn!(process = %self.spec.name, error = %e, "Failed to wait for process");
                }
                Err(_) => {
                    warn!(process = %self.spec.name, "Grace period elapsed, killing process");
                    if let Err(e) = child.kill().await {
                        warn!(process = %self.spec.name, error = %e, "Failed to kill process");
                    }
                }
            }
        }
        self.state = ProcessState::Stopped;
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid = pid, error = %e, "Failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to stop process");
    }
}
