//! Signature verification against the trusted public key.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sigstage_record::ImageReference;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::tool::ToolError;
use crate::tools::{Namespace, VerifyingTool};

pub struct VerificationGateway {
    verifier: Arc<dyn VerifyingTool>,
    trusted_key: PathBuf,
}

impl VerificationGateway {
    pub fn new(verifier: Arc<dyn VerifyingTool>, trusted_key: impl Into<PathBuf>) -> Self {
        Self {
            verifier,
            trusted_key: trusted_key.into(),
        }
    }

    pub fn trusted_key(&self) -> &Path {
        &self.trusted_key
    }

    /// Check that `image` carries a valid signature in `namespace`.
    pub async fn verify(
        &self,
        image: &ImageReference,
        namespace: &Namespace,
    ) -> Result<(), PipelineError> {
        match self.verifier.verify(image, &self.trusted_key, namespace).await {
            Ok(()) => {
                info!(image = %image, namespace = namespace.name(), "Signature verified");
                Ok(())
            }
            Err(ToolError::Failed { diagnostics, .. }) => {
                warn!(image = %image, namespace = namespace.name(), "Signature verification failed");
                Err(PipelineError::VerificationFailed {
                    image: image.to_string(),
                    namespace: namespace.to_string(),
                    diagnostics,
                })
            }
            Err(other) => Err(other.into()),
        }
    }
}
