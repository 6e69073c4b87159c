//! Ephemeral loopback registry used to rehearse push and verify.
//!
//! A [`StagingRegistry`] owns the registry server process for one pipeline
//! invocation. The process is terminated on every exit path: explicitly
//! through [`StagingRegistry::shutdown`], and otherwise when the guard is
//! dropped (error return, panic, or cancelled future).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::tool::{ensure_installed, ToolError};
use crate::tools::Namespace;

/// Default loopback address of the staging registry.
pub const DEFAULT_STAGING_ADDRESS: &str = "127.0.0.1:7777";

/// Default repository inside the staging registry.
pub const DEFAULT_STAGING_REPOSITORY: &str = "local-signatures";

/// First delay between readiness probes; doubles up to [`MAX_PROBE_DELAY`].
const INITIAL_PROBE_DELAY: Duration = Duration::from_millis(50);

const MAX_PROBE_DELAY: Duration = Duration::from_secs(1);

/// Timeout for a single readiness request.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// How long the server must stay up after its first answer.
const READY_GRACE: Duration = Duration::from_millis(500);

const GRACE_POLL: Duration = Duration::from_millis(50);

/// Errors from starting the staging registry.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging registry must listen on a loopback address, got {0}")]
    NotLoopback(SocketAddr),

    #[error("staging address {address} is already in use: {source}")]
    AddressInUse {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start staging registry: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("staging registry exited before becoming ready: {0}")]
    Exited(String),

    #[error("staging registry at {address} not ready after {timeout:?}")]
    NotReady {
        address: SocketAddr,
        timeout: Duration,
    },

    #[error("readiness probe error: {0}")]
    Probe(#[from] reqwest::Error),

    #[error("staging registry i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Staging registry settings.
#[derive(Debug, Clone)]
pub struct StagingRegistryConfig {
    /// Path to the `crane` binary that serves the registry.
    pub crane_path: PathBuf,
    /// Loopback address to bind.
    pub address: SocketAddr,
    /// Repository name inside the registry.
    pub repository_name: String,
    /// How long to wait for the server to answer.
    pub readiness_timeout: Duration,
}

impl StagingRegistryConfig {
    pub fn new(crane_path: impl Into<PathBuf>, address: SocketAddr) -> Self {
        Self {
            crane_path: crane_path.into(),
            address,
            repository_name: DEFAULT_STAGING_REPOSITORY.to_string(),
            readiness_timeout: Duration::from_secs(10),
        }
    }

    /// Full repository path, e.g. `127.0.0.1:7777/local-signatures`.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.address, self.repository_name)
    }
}

/// Starts a staging registry for one pipeline invocation.
#[async_trait]
pub trait StagingLauncher: Send + Sync {
    fn ensure_installed(&self) -> Result<(), ToolError>;

    async fn launch(&self) -> Result<StagingRegistry, StagingError>;
}

/// Launches `crane registry serve` on the configured loopback address.
#[derive(Debug, Clone)]
pub struct CraneLauncher {
    config: StagingRegistryConfig,
}

impl CraneLauncher {
    pub fn new(config: StagingRegistryConfig) -> Result<Self, StagingError> {
        if !config.address.ip().is_loopback() {
            return Err(StagingError::NotLoopback(config.address));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &StagingRegistryConfig {
        &self.config
    }
}

#[async_trait]
impl StagingLauncher for CraneLauncher {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        ensure_installed("crane", &self.config.crane_path)
    }

    async fn launch(&self) -> Result<StagingRegistry, StagingError> {
        ensure_address_free(self.config.address).await?;

        let mut command = Command::new(&self.config.crane_path);
        command
            .args(["registry", "serve", "--address"])
            .arg(self.config.address.to_string());

        StagingRegistry::spawn(
            command,
            self.config.address,
            self.config.repository(),
            self.config.readiness_timeout,
        )
        .await
    }
}

/// Handle to a running staging registry.
#[derive(Debug)]
pub struct StagingRegistry {
    address: SocketAddr,
    repository: String,
    process: Option<Child>,
}

impl StagingRegistry {
    /// Spawn `command` as the registry server and wait until it answers.
    pub async fn spawn(
        mut command: Command,
        address: SocketAddr,
        repository: String,
        readiness_timeout: Duration,
    ) -> Result<Self, StagingError> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(StagingError::Spawn)?;

        info!(
            address = %address,
            pid = child.id(),
            "Staging registry started"
        );

        if let Err(e) = wait_until_ready(&mut child, address, readiness_timeout).await {
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "Staging registry already gone");
            }
            return Err(e);
        }

        debug!(address = %address, "Staging registry ready");

        Ok(Self {
            address,
            repository,
            process: Some(child),
        })
    }

    /// Handle for a registry whose process this pipeline does not own.
    pub fn unmanaged(address: SocketAddr, repository: impl Into<String>) -> Self {
        Self {
            address,
            repository: repository.into(),
            process: None,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// OS process id of the server, if this handle owns one.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// Signature namespace backed by this registry.
    pub fn namespace(&self) -> Namespace {
        Namespace::staging(self.repository.clone())
    }

    /// Terminate the server and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.process.take() {
            match child.kill().await {
                Ok(()) => info!(address = %self.address, "Staging registry stopped"),
                Err(e) => warn!(address = %self.address, error = %e, "Failed to stop staging registry"),
            }
        }
    }
}

impl Drop for StagingRegistry {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Staging registry already exited");
            } else {
                warn!(address = %self.address, "Staging registry killed on drop");
            }
        }
    }
}

/// Fail if something already listens on `address`.
///
/// A server found there would answer the readiness probe in place of the
/// one this run starts.
pub async fn ensure_address_free(address: SocketAddr) -> Result<(), StagingError> {
    match TcpListener::bind(address).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(source) => Err(StagingError::AddressInUse { address, source }),
    }
}

/// Probe `GET /v2/` with backoff until any HTTP response arrives, then
/// require the child to outlive [`READY_GRACE`].
async fn wait_until_ready(
    child: &mut Child,
    address: SocketAddr,
    timeout: Duration,
) -> Result<(), StagingError> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_REQUEST_TIMEOUT)
        .build()?;
    let url = format!("http://{address}/v2/");
    let deadline = Instant::now() + timeout;
    let mut delay = INITIAL_PROBE_DELAY;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(StagingError::Exited(status.to_string()));
        }

        match client.get(&url).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "Staging registry answered");
                return ensure_still_running(child).await;
            }
            Err(e) => debug!(error = %e, "Staging registry not ready yet"),
        }

        if Instant::now() + delay > deadline {
            return Err(StagingError::NotReady { address, timeout });
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_PROBE_DELAY);
    }
}

/// An answer from a child that then exits came from some other server.
async fn ensure_still_running(child: &mut Child) -> Result<(), StagingError> {
    let until = Instant::now() + READY_GRACE;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(StagingError::Exited(status.to_string()));
        }
        if Instant::now() >= until {
            return Ok(());
        }
        tokio::time::sleep(GRACE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_joins_address_and_name() {
        let config = StagingRegistryConfig::new("crane", DEFAULT_STAGING_ADDRESS.parse().unwrap());
        assert_eq!(config.repository(), "127.0.0.1:7777/local-signatures");
    }

    #[test]
    fn launcher_rejects_non_loopback_address() {
        let config = StagingRegistryConfig::new("crane", "10.0.0.1:7777".parse().unwrap());
        assert!(matches!(
            CraneLauncher::new(config),
            Err(StagingError::NotLoopback(_))
        ));
    }

    #[tokio::test]
    async fn bound_address_is_reported_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        assert!(matches!(
            ensure_address_free(address).await,
            Err(StagingError::AddressInUse { .. })
        ));

        drop(listener);
        assert!(ensure_address_free(address).await.is_ok());
    }

    #[test]
    fn unmanaged_handle_has_no_process() {
        let registry =
            StagingRegistry::unmanaged("127.0.0.1:7777".parse().unwrap(), "127.0.0.1:7777/x");
        assert_eq!(registry.pid(), None);
        assert_eq!(registry.namespace(), Namespace::staging("127.0.0.1:7777/x"));
    }
}
