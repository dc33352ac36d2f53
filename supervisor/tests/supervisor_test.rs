// Integration tests for the process supervisor
//
// Children are plain `sleep` / `sh` processes; the callback health endpoint is
// a mockito server.
#![cfg(unix)]

use kite_supervisor::{ProcessSpec, ProcessState, Supervisor, SupervisorConfig};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::{Duration, Instant};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn config(startup_timeout: Duration, stop_grace: Duration) -> SupervisorConfig {
    SupervisorConfig {
        monitor_interval: Duration::from_millis(100),
        startup_timeout,
        stop_grace,
        callback_bin: PathBuf::from("unused"),
        mcp_bin: PathBuf::from("unused"),
        callback_health_url: String::new(),
    }
}

fn sleeper(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, "sleep").args(["30"])
}

/// Child that ignores SIGTERM
fn stubborn(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, "sh").args(["-c", "trap '' TERM; sleep 30"])
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn healthy_server() -> (mockito::ServerGuard, mockito::Mock) {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/health")
        .with_status(200)
        .with_body(r#"{"status":"healthy","server":"callback"}"#)
        .create_async()
        .await;
    (server, mock)
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Startup waits for the callback health probe, then starts the MCP server
#[tokio::test]
async fn test_start_marks_both_healthy() {
    let (server, mock) = healthy_server().await;
    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(5), Duration::from_secs(2)),
        sleeper("callback").health_url(format!("{}/health", server.url())),
        sleeper("mcp"),
    )
    .unwrap();

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.callback().state(), ProcessState::Healthy);
    assert_eq!(supervisor.mcp().state(), ProcessState::Healthy);
    mock.assert_async().await;

    supervisor.stop_all().await;
    assert_eq!(supervisor.callback().state(), ProcessState::Stopped);
    assert_eq!(supervisor.mcp().state(), ProcessState::Stopped);
}

/// A killed child is respawned; its sibling keeps running untouched
#[tokio::test]
async fn test_crashed_child_restarts_independently() {
    let (server, _mock) = healthy_server().await;
    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(5), Duration::from_secs(2)),
        sleeper("callback").health_url(format!("{}/health", server.url())),
        sleeper("mcp"),
    )
    .unwrap();
    supervisor.start().await.unwrap();

    let callback_pid = supervisor.callback().pid().unwrap();
    let mcp_pid = supervisor.mcp().pid().unwrap();

    kill(Pid::from_raw(callback_pid as i32), Signal::SIGKILL).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        supervisor.monitor_once().await;
        if supervisor.callback().restart_count == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "callback was never restarted");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let new_pid = supervisor.callback().pid().unwrap();
    assert_ne!(new_pid, callback_pid);
    assert_eq!(supervisor.mcp().pid(), Some(mcp_pid));
    assert_eq!(supervisor.mcp().restart_count, 0);
    assert!(is_alive(mcp_pid));

    // Restarted callback is promoted once its probe answers
    supervisor.monitor_once().await;
    assert_eq!(supervisor.callback().state(), ProcessState::Healthy);

    supervisor.stop_all().await;
}

/// Callback never healthy → startup error and no children left behind
#[tokio::test]
async fn test_startup_health_timeout() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/health")
        .with_status(503)
        .create_async()
        .await;
    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(1), Duration::from_secs(2)),
        sleeper("callback").health_url(format!("{}/health", server.url())),
        sleeper("mcp"),
    )
    .unwrap();

    let started = Instant::now();
    let result = supervisor.start().await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.callback().state(), ProcessState::Stopped);
    assert!(supervisor.callback().pid().is_none());
    assert!(supervisor.mcp().pid().is_none());
}

/// Callback exits before answering → startup error without waiting out the timeout
#[tokio::test]
async fn test_startup_child_exits() {
    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(30), Duration::from_secs(2)),
        ProcessSpec::new("callback", "false").health_url("http://127.0.0.1:1/health"),
        sleeper("mcp"),
    )
    .unwrap();

    let started = Instant::now();
    let result = supervisor.start().await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(supervisor.mcp().pid().is_none());
}

/// Health URL answered by someone else while the child dies → startup error
#[tokio::test]
async fn test_startup_rejects_answer_from_foreign_listener() {
    let (server, _mock) = healthy_server().await;
    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(5), Duration::from_secs(2)),
        ProcessSpec::new("callback", "sh")
            .args(["-c", "sleep 0.05; exit 3"])
            .health_url(format!("{}/health", server.url())),
        sleeper("mcp"),
    )
    .unwrap();

    let result = supervisor.start().await;

    assert!(result.is_err());
    assert_ne!(supervisor.callback().state(), ProcessState::Healthy);
    assert!(supervisor.mcp().pid().is_none());
}

/// Shutdown terminates both children within the grace bound, killing one
/// that ignores SIGTERM
#[tokio::test]
async fn test_shutdown_within_grace() {
    let (server, _mock) = healthy_server().await;
    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(5), Duration::from_secs(1)),
        sleeper("callback").health_url(format!("{}/health", server.url())),
        stubborn("mcp"),
    )
    .unwrap();

    let started = Instant::now();
    supervisor
        .run(tokio::time::sleep(Duration::from_millis(500)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.callback().state(), ProcessState::Stopped);
    assert_eq!(supervisor.mcp().state(), ProcessState::Stopped);
    assert!(supervisor.callback().pid().is_none());
    assert!(supervisor.mcp().pid().is_none());
}

/// A child whose binary disappears is retried on every monitoring pass
#[tokio::test]
async fn test_spawn_failure_retried() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("kite-mcp");
    std::os::unix::fs::symlink("/bin/sleep", &program).unwrap();

    let mut supervisor = Supervisor::new(
        config(Duration::from_secs(5), Duration::from_secs(1)),
        sleeper("callback"),
        ProcessSpec::new("mcp", &program).args(["30"]),
    )
    .unwrap();
    supervisor.start().await.unwrap();
    let mcp_pid = supervisor.mcp().pid().unwrap();

    std::fs::remove_file(&program).unwrap();
    kill(Pid::from_raw(mcp_pid as i32), Signal::SIGKILL).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.mcp().last_error.is_none() || supervisor.mcp().is_running() {
        supervisor.monitor_once().await;
        assert!(Instant::now() < deadline, "exit was never observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Still missing: every pass retries and fails again
    supervisor.monitor_once().await;
    assert_eq!(supervisor.mcp().state(), ProcessState::Crashed);
    assert!(supervisor
        .mcp()
        .last_error
        .as_deref()
        .unwrap()
        .contains("Failed to spawn"));

    std::os::unix::fs::symlink("/bin/sleep", &program).unwrap();
    supervisor.monitor_once().await;
    assert_eq!(supervisor.mcp().state(), ProcessState::Starting);
    assert!(supervisor.mcp().pid().is_some());

    supervisor.stop_all().await;
}
