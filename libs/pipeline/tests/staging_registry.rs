//! Staging registry lifecycle against real short-lived processes.
//!
//! A loopback TCP responder stands in for the registry's HTTP endpoint;
//! `sleep` stands in for the server process.

#![cfg(target_os = "linux")]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use sigstage_pipeline::{
    CraneLauncher, StagingError, StagingLauncher, StagingRegistry, StagingRegistryConfig,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;

const REPOSITORY: &str = "local-signatures";

/// Answer every connection with an empty `200 OK`.
async fn responder() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            });
        }
    });
    address
}

/// A loopback address nothing listens on.
async fn unused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn sleeper() -> Command {
    let mut command = Command::new("sleep");
    command.arg("30");
    command
}

/// True once `pid` has exited (gone or a zombie awaiting reaping).
fn exited(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
        Err(_) => true,
    }
}

async fn wait_for_exit(pid: u32) -> bool {
    for _ in 0..50 {
        if exited(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn ready_registry_is_stopped_by_shutdown() {
    let address = responder().await;

    let registry = StagingRegistry::spawn(
        sleeper(),
        address,
        format!("{address}/{REPOSITORY}"),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    assert_eq!(registry.address(), address);
    assert_eq!(registry.repository(), format!("{address}/{REPOSITORY}"));
    let pid = registry.pid().unwrap();
    assert!(!exited(pid));

    registry.shutdown().await;
    assert!(wait_for_exit(pid).await);
}

#[tokio::test]
async fn dropping_the_guard_kills_the_registry() {
    let address = responder().await;

    let registry = StagingRegistry::spawn(
        sleeper(),
        address,
        format!("{address}/{REPOSITORY}"),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let pid = registry.pid().unwrap();

    drop(registry);
    assert!(wait_for_exit(pid).await);
}

#[tokio::test]
async fn unanswered_probe_times_out() {
    let address = unused_address().await;

    let err = StagingRegistry::spawn(
        sleeper(),
        address,
        format!("{address}/{REPOSITORY}"),
        Duration::from_millis(300),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagingError::NotReady { .. }));
}

#[tokio::test]
async fn process_exiting_early_fails_fast() {
    let address = unused_address().await;

    let started = std::time::Instant::now();
    let err = StagingRegistry::spawn(
        Command::new("true"),
        address,
        format!("{address}/{REPOSITORY}"),
        Duration::from_secs(10),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagingError::Exited(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn unknown_program_fails_to_spawn() {
    let address = unused_address().await;

    let err = StagingRegistry::spawn(
        Command::new("/nonexistent/crane"),
        address,
        format!("{address}/{REPOSITORY}"),
        Duration::from_secs(1),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagingError::Spawn(_)));
}

#[tokio::test]
async fn server_exiting_after_a_foreign_answer_is_rejected() {
    // Something else already answers on the port; our server fails to bind.
    let address = responder().await;
    let mut command = Command::new("sh");
    command.args(["-c", "sleep 0.3; echo 'bind: address already in use' >&2; exit 1"]);

    let err = StagingRegistry::spawn(
        command,
        address,
        format!("{address}/{REPOSITORY}"),
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagingError::Exited(_)));
}

#[tokio::test]
async fn launcher_refuses_an_occupied_address() {
    let address = responder().await;
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("started");
    let crane = dir.path().join("crane");
    std::fs::write(
        &crane,
        format!("#!/bin/sh\ntouch '{}'\nexec sleep 30\n", marker.display()),
    )
    .unwrap();
    std::fs::set_permissions(&crane, std::fs::Permissions::from_mode(0o755)).unwrap();

    let launcher = CraneLauncher::new(StagingRegistryConfig::new(&crane, address)).unwrap();
    let err = launcher.launch().await.unwrap_err();

    assert!(matches!(err, StagingError::AddressInUse { .. }));
    assert!(!marker.exists());
}

#[test]
fn launcher_reports_missing_crane() {
    let config = StagingRegistryConfig::new("/nonexistent/crane", "127.0.0.1:7777".parse().unwrap());
    let launcher = CraneLauncher::new(config).unwrap();
    assert!(launcher.ensure_installed().is_err());
}
