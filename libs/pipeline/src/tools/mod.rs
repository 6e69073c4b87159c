//! External signing, verification, and transfer capabilities.
//!
//! The pipeline only talks to these traits. Production uses the
//! CLI-backed implementations (`cosign`, `oras`, `crane`); tests use
//! [`crate::mock::MockToolchain`].

mod cosign;
mod transfer;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sigstage_record::ImageReference;

use crate::error::PipelineError;
use crate::staging::StagingLauncher;
use crate::tool::ToolError;

pub use cosign::CosignCli;
pub use transfer::RegistryCli;

/// Which key signs: a key file or a hardware security key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    KeyFile(PathBuf),
    HardwareKey,
}

impl KeySelector {
    /// Build from the two mutually exclusive operator inputs.
    pub fn from_flags(key: Option<PathBuf>, hardware: bool) -> Result<Self, PipelineError> {
        match (key, hardware) {
            (Some(path), false) => Ok(Self::KeyFile(path)),
            (None, true) => Ok(Self::HardwareKey),
            (Some(_), true) => Err(PipelineError::Configuration(
                "provide either a key file or a hardware key, not both".to_string(),
            )),
            (None, false) => Err(PipelineError::Configuration(
                "provide either a key file or a hardware key".to_string(),
            )),
        }
    }

    /// Signing-tool arguments selecting this key.
    pub fn cli_args(&self) -> Vec<OsString> {
        match self {
            Self::KeyFile(path) => vec!["--key".into(), path.as_os_str().to_os_string()],
            Self::HardwareKey => vec!["--sk".into()],
        }
    }
}

/// Where signatures are stored and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    /// The loopback staging registry's repository.
    Staging { repository: String },
    /// The image's own repository.
    Target,
}

impl Namespace {
    pub fn staging(repository: impl Into<String>) -> Self {
        Self::Staging {
            repository: repository.into(),
        }
    }

    /// Repository that holds `image`'s signature in this namespace.
    pub fn repository_for<'a>(&'a self, image: &'a ImageReference) -> &'a str {
        match self {
            Self::Staging { repository } => repository,
            Self::Target => image.repository(),
        }
    }

    /// Override for the signing tool's signature repository.
    pub fn signature_repository_override(&self) -> Option<&str> {
        match self {
            Self::Staging { repository } => Some(repository),
            Self::Target => None,
        }
    }

    /// The staging registry speaks plain HTTP.
    pub fn plain_http(&self) -> bool {
        matches!(self, Self::Staging { .. })
    }

    pub fn is_staging(&self) -> bool {
        matches!(self, Self::Staging { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Staging { .. } => "staging",
            Self::Target => "target",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staging { repository } => write!(f, "staging ({repository})"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// How signatures are produced and stored in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// Sign into a registry, then fetch the signature manifest and blob back.
    #[default]
    RegistryAttached,
    /// Produce payload, signature, and certificate files without a registry.
    Detached,
}

/// Produces signatures.
#[async_trait]
pub trait SigningTool: Send + Sync {
    fn ensure_installed(&self) -> Result<(), ToolError>;

    /// Sign `image` and store the signature in `namespace`.
    async fn sign(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        namespace: &Namespace,
    ) -> Result<(), ToolError>;

    /// Generate the payload a detached signature covers.
    async fn generate_payload(&self, image: &ImageReference) -> Result<Vec<u8>, ToolError>;

    /// Sign `payload` without uploading, writing signature and certificate.
    async fn sign_detached(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        payload: &Path,
        signature_out: &Path,
        certificate_out: &Path,
    ) -> Result<(), ToolError>;

    /// Attach a detached payload + signature to `image` in `namespace`.
    async fn attach(
        &self,
        image: &ImageReference,
        payload: &Path,
        signature: &Path,
        namespace: &Namespace,
    ) -> Result<(), ToolError>;
}

/// Checks signatures against a public key.
#[async_trait]
pub trait VerifyingTool: Send + Sync {
    fn ensure_installed(&self) -> Result<(), ToolError>;

    async fn verify(
        &self,
        image: &ImageReference,
        trusted_key: &Path,
        namespace: &Namespace,
    ) -> Result<(), ToolError>;
}

/// Moves manifests and blobs between registries and local files.
#[async_trait]
pub trait TransferTool: Send + Sync {
    fn ensure_installed(&self) -> Result<(), ToolError>;

    /// Fetch the manifest (or manifest list) of an image.
    async fn fetch_image_manifest(&self, image: &ImageReference) -> Result<Vec<u8>, ToolError>;

    /// Fetch a manifest by `repo:tag` or `repo@digest`.
    async fn fetch_manifest(&self, reference: &str, plain_http: bool)
        -> Result<Vec<u8>, ToolError>;

    async fn fetch_blob(
        &self,
        repository: &str,
        digest: &str,
        dest: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError>;

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        src: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError>;

    /// Push a manifest file to `repo:tag`.
    async fn push_manifest(
        &self,
        reference: &str,
        src: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError>;

    /// Point a mutable tag of the image's repository at `image`.
    async fn tag(&self, image: &ImageReference, tag: &str) -> Result<(), ToolError>;
}

/// The full set of external capabilities a pipeline run needs.
#[derive(Clone)]
pub struct Toolchain {
    pub signer: Arc<dyn SigningTool>,
    pub verifier: Arc<dyn VerifyingTool>,
    pub transfer: Arc<dyn TransferTool>,
    pub staging: Arc<dyn StagingLauncher>,
}

impl Toolchain {
    /// Fail before any work if a capability is missing.
    pub fn ensure_installed(&self) -> Result<(), PipelineError> {
        self.signer.ensure_installed()?;
        self.verifier.ensure_installed()?;
        self.transfer.ensure_installed()?;
        self.staging.ensure_installed()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    #[test]
    fn key_selector_requires_exactly_one_source() {
        assert_eq!(
            KeySelector::from_flags(Some("cosign.key".into()), false).unwrap(),
            KeySelector::KeyFile("cosign.key".into())
        );
        assert_eq!(
            KeySelector::from_flags(None, true).unwrap(),
            KeySelector::HardwareKey
        );
        assert!(matches!(
            KeySelector::from_flags(Some("cosign.key".into()), true),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            KeySelector::from_flags(None, false),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn key_selector_cli_args() {
        assert_eq!(KeySelector::HardwareKey.cli_args(), vec![OsString::from("--sk")]);
        assert_eq!(
            KeySelector::KeyFile("k.key".into()).cli_args(),
            vec![OsString::from("--key"), OsString::from("k.key")]
        );
    }

    #[test]
    fn namespace_selects_repository() {
        let image = ImageReference::parse(&format!("ghcr.io/org/app@sha256:{HEX}")).unwrap();
        let staging = Namespace::staging("127.0.0.1:7777/local-signatures");

        assert_eq!(staging.repository_for(&image), "127.0.0.1:7777/local-signatures");
        assert!(staging.plain_http());
        assert_eq!(
            staging.signature_repository_override(),
            Some("127.0.0.1:7777/local-signatures")
        );

        assert_eq!(Namespace::Target.repository_for(&image), "ghcr.io/org/app");
        assert!(!Namespace::Target.plain_http());
        assert_eq!(Namespace::Target.signature_repository_override(), None);
    }
}
