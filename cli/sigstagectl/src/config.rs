//! Configuration loading.
//!
//! Settings are layered, highest precedence first:
//! - command-line flags and `SIGSTAGE_*` environment variables
//! - `config.json` in the platform config directory (or `--config`)
//! - built-in defaults

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sigstage_pipeline::{DEFAULT_STAGING_ADDRESS, DEFAULT_STAGING_REPOSITORY};

use crate::error::CliError;

/// Configuration file name.
const CONFIG_FILE: &str = "config.json";

const DEFAULT_TOOLS_DIR: &str = "assets";
const DEFAULT_TRUSTED_KEY: &str = "trusted.pub";
const DEFAULT_SIGNATURES_DIR: &str = "SIGNATURES";
const DEFAULT_PUBLISHED_DIR: &str = "PUBLISHED";
const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default config file path.
fn default_config_path() -> Result<PathBuf> {
    ProjectDirs::from("dev", "sigstage", "sigstage")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// One layer of optional settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory holding `cosign`, `oras/oras`, and `crane/crane`.
    pub tools_dir: Option<PathBuf>,
    pub cosign: Option<PathBuf>,
    pub oras: Option<PathBuf>,
    pub crane: Option<PathBuf>,
    /// Public key signatures are verified against.
    pub trusted_key: Option<PathBuf>,
    pub staging_address: Option<String>,
    pub staging_repository: Option<String>,
    pub readiness_timeout_secs: Option<u64>,
    pub signatures_dir: Option<PathBuf>,
    pub published_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Settings {
    /// Fill unset values from `lower`.
    pub fn or(self, lower: Settings) -> Settings {
        Settings {
            tools_dir: self.tools_dir.or(lower.tools_dir),
            cosign: self.cosign.or(lower.cosign),
            oras: self.oras.or(lower.oras),
            crane: self.crane.or(lower.crane),
            trusted_key: self.trusted_key.or(lower.trusted_key),
            staging_address: self.staging_address.or(lower.staging_address),
            staging_repository: self.staging_repository.or(lower.staging_repository),
            readiness_timeout_secs: self.readiness_timeout_secs.or(lower.readiness_timeout_secs),
            signatures_dir: self.signatures_dir.or(lower.signatures_dir),
            published_dir: self.published_dir.or(lower.published_dir),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    /// Read a settings file. A missing default file is not an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))
    }
}

/// Effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub cosign: PathBuf,
    pub oras: PathBuf,
    pub crane: PathBuf,
    pub trusted_key: PathBuf,
    pub staging_address: SocketAddr,
    pub staging_repository: String,
    #[serde(rename = "readiness_timeout_secs", serialize_with = "serialize_secs")]
    pub readiness_timeout: Duration,
    pub signatures_dir: PathBuf,
    pub published_dir: PathBuf,
    pub log_level: String,
    /// Config file that contributed settings, if any.
    pub config_file: Option<PathBuf>,
}

fn serialize_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

impl Config {
    /// Load the config file (explicit or default) under `overrides`.
    pub fn load(explicit_file: Option<&Path>, overrides: Settings) -> Result<Self> {
        let (file_settings, config_file) = match explicit_file {
            Some(path) => (Settings::from_file(path)?, Some(path.to_path_buf())),
            None => {
                let path = default_config_path()?;
                if path.exists() {
                    (Settings::from_file(&path)?, Some(path))
                } else {
                    (Settings::default(), None)
                }
            }
        };

        let mut config = Self::resolve(overrides.or(file_settings))?;
        config.config_file = config_file;
        Ok(config)
    }

    /// Apply defaults to merged settings.
    pub fn resolve(settings: Settings) -> Result<Self, CliError> {
        let tools_dir = settings
            .tools_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOLS_DIR));

        let address = settings
            .staging_address
            .unwrap_or_else(|| DEFAULT_STAGING_ADDRESS.to_string());
        let staging_address: SocketAddr = address
            .parse()
            .map_err(|_| CliError::Config(format!("invalid staging address '{address}'")))?;
        if !staging_address.ip().is_loopback() {
            return Err(CliError::Config(format!(
                "staging address {staging_address} is not a loopback address"
            )));
        }

        Ok(Self {
            cosign: settings.cosign.unwrap_or_else(|| tools_dir.join("cosign")),
            oras: settings
                .oras
                .unwrap_or_else(|| tools_dir.join("oras").join("oras")),
            crane: settings
                .crane
                .unwrap_or_else(|| tools_dir.join("crane").join("crane")),
            trusted_key: settings
                .trusted_key
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TRUSTED_KEY)),
            staging_address,
            staging_repository: settings
                .staging_repository
                .unwrap_or_else(|| DEFAULT_STAGING_REPOSITORY.to_string()),
            readiness_timeout: Duration::from_secs(
                settings
                    .readiness_timeout_secs
                    .unwrap_or(DEFAULT_READINESS_TIMEOUT_SECS),
            ),
            signatures_dir: settings
                .signatures_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SIGNATURES_DIR)),
            published_dir: settings
                .published_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLISHED_DIR)),
            log_level: settings
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            config_file: None,
        })
    }
}
