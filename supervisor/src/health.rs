use crate::process::ManagedProcess;
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Per-probe request timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn probe_client() -> Result<Client> {
    Ok(Client::builder().timeout(PROBE_TIMEOUT).build()?)
}

/// One GET against a health URL. Any 2xx counts as healthy.
pub async fn probe(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(url = %url, error = %e, "Health probe failed");
            false
        }
    }
}

/// Polls `url` every `poll_interval` until it answers, the process exits, or
/// `timeout` elapses. A process still alive one interval after the first
/// successful answer is marked healthy.
///
/// # Arguments
/// * `process` - Freshly spawned process; an early exit aborts the wait
/// * `url` - Health endpoint of that process
pub async fn wait_healthy(
    client: &Client,
    process: &mut ManagedProcess,
    url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = process.poll_exit() {
            return Err(anyhow!(
                "{} exited during startup ({})",
                process.name(),
                status
            ));
        }
        if probe(client, url).await {
            // Another listener on the same port can answer for a child that
            // is about to die on a failed bind
            tokio::time::sleep(poll_interval).await;
            if let Some(status) = process.poll_exit() {
                return Err(anyhow!(
                    "{} exited right after its health URL answered ({}); is the port already in use?",
                    process.name(),
                    status
                ));
            }
            process.mark_healthy();
            return Ok(());
        }
        if Instant::now() + poll_interval > deadline {
            return Err(anyhow!(
                "{} did not become healthy within {}s",
                process.name(),
                timeout.as_secs_f64()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
