//! `cosign`-backed signing and verification.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sigstage_record::ImageReference;

use super::{KeySelector, Namespace, SigningTool, VerifyingTool};
use crate::tool::{ensure_installed, ToolCommand, ToolError};

const TOOL: &str = "cosign";

/// Environment variable redirecting where cosign stores signatures.
const SIGNATURE_REPOSITORY_ENV: &str = "COSIGN_REPOSITORY";

/// Runs the `cosign` binary.
#[derive(Debug, Clone)]
pub struct CosignCli {
    path: PathBuf,
}

impl CosignCli {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self) -> ToolCommand {
        ToolCommand::new(TOOL, &self.path)
    }

    fn in_namespace(cmd: ToolCommand, namespace: &Namespace) -> ToolCommand {
        match namespace.signature_repository_override() {
            Some(repository) => cmd.env(SIGNATURE_REPOSITORY_ENV, repository),
            None => cmd,
        }
    }

    pub(crate) fn sign_command(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        namespace: &Namespace,
    ) -> ToolCommand {
        let cmd = self
            .command()
            .args(["sign", "-d", "-y"])
            .args(key.cli_args())
            .arg(image.to_string());
        Self::in_namespace(cmd, namespace)
    }

    pub(crate) fn verify_command(
        &self,
        image: &ImageReference,
        trusted_key: &Path,
        namespace: &Namespace,
    ) -> ToolCommand {
        let cmd = self
            .command()
            .args(["verify", "-d", "--key"])
            .arg(trusted_key)
            .arg(image.to_string());
        Self::in_namespace(cmd, namespace)
    }
}

#[async_trait]
impl SigningTool for CosignCli {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        ensure_installed(TOOL, &self.path)
    }

    async fn sign(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        namespace: &Namespace,
    ) -> Result<(), ToolError> {
        self.sign_command(image, key, namespace).run().await
    }

    async fn generate_payload(&self, image: &ImageReference) -> Result<Vec<u8>, ToolError> {
        self.command()
            .arg("generate")
            .arg(image.to_string())
            .output()
            .await
    }

    async fn sign_detached(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        payload: &Path,
        signature_out: &Path,
        certificate_out: &Path,
    ) -> Result<(), ToolError> {
        self.command()
            .args(["sign", "-d", "--upload=false", "-y", "--output-signature"])
            .arg(signature_out)
            .arg("--output-certificate")
            .arg(certificate_out)
            .arg("--payload")
            .arg(payload)
            .args(key.cli_args())
            .arg(image.to_string())
            .run()
            .await
    }

    async fn attach(
        &self,
        image: &ImageReference,
        payload: &Path,
        signature: &Path,
        namespace: &Namespace,
    ) -> Result<(), ToolError> {
        let cmd = self
            .command()
            .args(["attach", "signature", "--payload"])
            .arg(payload)
            .arg("--signature")
            .arg(signature)
            .arg(image.to_string());
        Self::in_namespace(cmd, namespace).run().await
    }
}

#[async_trait]
impl VerifyingTool for CosignCli {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        ensure_installed(TOOL, &self.path)
    }

    async fn verify(
        &self,
        image: &ImageReference,
        trusted_key: &Path,
        namespace: &Namespace,
    ) -> Result<(), ToolError> {
        self.verify_command(image, trusted_key, namespace)
            .run()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    fn image() -> ImageReference {
        ImageReference::parse(&format!("ghcr.io/org/app@sha256:{HEX}")).unwrap()
    }

    #[test]
    fn sign_in_staging_redirects_signature_repository() {
        let cosign = CosignCli::new("/assets/cosign");
        let cmd = cosign.sign_command(
            &image(),
            &KeySelector::HardwareKey,
            &Namespace::staging("127.0.0.1:7777/local-signatures"),
        );
        assert_eq!(
            cmd.command_line(),
            format!(
                "COSIGN_REPOSITORY=127.0.0.1:7777/local-signatures /assets/cosign sign -d -y --sk ghcr.io/org/app@sha256:{HEX}"
            )
        );
    }

    #[test]
    fn verify_in_target_uses_image_repository() {
        let cosign = CosignCli::new("/assets/cosign");
        let cmd = cosign.verify_command(&image(), Path::new("trusted.pub"), &Namespace::Target);
        assert!(cmd.environment().is_empty());
        assert_eq!(
            cmd.command_line(),
            format!("/assets/cosign verify -d --key trusted.pub ghcr.io/org/app@sha256:{HEX}")
        );
    }
}
