//! Registry transfer through `oras` (manifests and blobs) and `crane`
//! (image manifests and tags).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sigstage_record::ImageReference;

use super::TransferTool;
use crate::tool::{ensure_installed, ToolCommand, ToolError};

const ORAS: &str = "oras";
const CRANE: &str = "crane";
const PLAIN_HTTP: &str = "--plain-http";

/// Runs the `oras` and `crane` binaries.
#[derive(Debug, Clone)]
pub struct RegistryCli {
    oras: PathBuf,
    crane: PathBuf,
}

impl RegistryCli {
    pub fn new(oras: impl Into<PathBuf>, crane: impl Into<PathBuf>) -> Self {
        Self {
            oras: oras.into(),
            crane: crane.into(),
        }
    }

    fn oras(&self) -> ToolCommand {
        ToolCommand::new(ORAS, &self.oras)
    }

    fn crane(&self) -> ToolCommand {
        ToolCommand::new(CRANE, &self.crane)
    }

    pub(crate) fn push_blob_command(
        &self,
        repository: &str,
        digest: &str,
        src: &Path,
        plain_http: bool,
    ) -> ToolCommand {
        self.oras()
            .args(["blob", "push"])
            .arg(format!("{repository}@{digest}"))
            .arg(src)
            .flag_if(plain_http, PLAIN_HTTP)
    }
}

#[async_trait]
impl TransferTool for RegistryCli {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        ensure_installed(ORAS, &self.oras)?;
        ensure_installed(CRANE, &self.crane)
    }

    async fn fetch_image_manifest(&self, image: &ImageReference) -> Result<Vec<u8>, ToolError> {
        self.crane()
            .arg("manifest")
            .arg(image.to_string())
            .output()
            .await
    }

    async fn fetch_manifest(
        &self,
        reference: &str,
        plain_http: bool,
    ) -> Result<Vec<u8>, ToolError> {
        self.oras()
            .args(["manifest", "fetch", reference])
            .flag_if(plain_http, PLAIN_HTTP)
            .output()
            .await
    }

    async fn fetch_blob(
        &self,
        repository: &str,
        digest: &str,
        dest: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError> {
        self.oras()
            .args(["blob", "fetch"])
            .arg(format!("{repository}@{digest}"))
            .flag_if(plain_http, PLAIN_HTTP)
            .arg("--output")
            .arg(dest)
            .run()
            .await
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        src: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError> {
        self.push_blob_command(repository, digest, src, plain_http)
            .run()
            .await
    }

    async fn push_manifest(
        &self,
        reference: &str,
        src: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError> {
        self.oras()
            .args(["manifest", "push", reference])
            .arg(src)
            .flag_if(plain_http, PLAIN_HTTP)
            .run()
            .await
    }

    async fn tag(&self, image: &ImageReference, tag: &str) -> Result<(), ToolError> {
        self.crane()
            .arg("tag")
            .arg(image.to_string())
            .arg(tag)
            .run()
            .await
    }
}
