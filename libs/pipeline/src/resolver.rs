//! Expansion of a root image into its per-platform sub-images.

use std::collections::HashSet;
use std::sync::Arc;

use sigstage_record::{ManifestDocument, PlatformImage, RootImage};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::tools::TransferTool;

/// Resolves manifest lists one level deep.
pub struct ManifestResolver {
    transfer: Arc<dyn TransferTool>,
}

impl ManifestResolver {
    pub fn new(transfer: Arc<dyn TransferTool>) -> Self {
        Self { transfer }
    }

    /// Platform sub-images of `root`, in manifest order.
    ///
    /// A single-platform image yields an empty list. An entry that is
    /// itself a manifest list fails the whole resolution with
    /// [`PipelineError::UnsupportedManifestShape`]; nothing is returned for
    /// its siblings.
    pub async fn resolve(&self, root: &RootImage) -> Result<Vec<PlatformImage>, PipelineError> {
        let bytes = self.transfer.fetch_image_manifest(root.reference()).await?;
        let document = ManifestDocument::from_slice(&bytes)
            .map_err(|e| PipelineError::manifest_shape(root, e))?;

        let index = match document {
            ManifestDocument::Image(_) => {
                debug!(image = %root, "Single-platform image");
                return Ok(Vec::new());
            }
            ManifestDocument::Index(index) => index,
        };

        let mut seen = HashSet::new();
        let mut platforms = Vec::with_capacity(index.manifests.len());

        for entry in &index.manifests {
            let platform = root
                .platform(&entry.digest)
                .map_err(|e| PipelineError::from_record(root, e))?;

            let nested = match entry.media_type {
                Some(_) => entry.is_index(),
                None => self.is_index(&platform).await?,
            };
            if nested {
                return Err(PipelineError::UnsupportedManifestShape {
                    image: root.to_string(),
                    reason: format!("entry {} is itself a manifest list", entry.digest),
                });
            }

            if platform.reference() == root.reference() || !seen.insert(platform.clone()) {
                continue;
            }
            platforms.push(platform);
        }

        info!(image = %root, platforms = platforms.len(), "Resolved manifest list");
        Ok(platforms)
    }

    /// Classify an entry that does not declare its media type.
    async fn is_index(&self, platform: &PlatformImage) -> Result<bool, PipelineError> {
        let bytes = self
            .transfer
            .fetch_image_manifest(platform.reference())
            .await?;
        let document = ManifestDocument::from_slice(&bytes)
            .map_err(|e| PipelineError::manifest_shape(platform, e))?;
        Ok(matches!(document, ManifestDocument::Index(_)))
    }
}
