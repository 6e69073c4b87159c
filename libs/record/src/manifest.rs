//! OCI manifest documents.
//!
//! Two shapes matter here:
//! - image manifests, including cosign signature manifests, which must
//!   reference exactly one layer blob to be stored in a record;
//! - image indexes (manifest lists), which fan a reference out into
//!   per-platform sub-manifests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ManifestShapeError;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Layer annotation holding a cosign signature.
pub const COSIGN_SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";

/// Returns true if the media type names a manifest list / image index.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Returns true if this descriptor points at another manifest list.
    pub fn is_index(&self) -> bool {
        self.media_type.as_deref().is_some_and(is_index_media_type)
    }

    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Parse a manifest from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestShapeError> {
        serde_json::from_slice(bytes).map_err(|e| ManifestShapeError::Malformed(e.to_string()))
    }

    /// The one layer of a single-signature manifest.
    ///
    /// Zero or several layers are rejected rather than picking one.
    pub fn single_layer(&self) -> Result<&Descriptor, ManifestShapeError> {
        match self.layers.as_slice() {
            [layer] => Ok(layer),
            [] => Err(ManifestShapeError::NoLayers),
            layers => Err(ManifestShapeError::MultipleLayers(layers.len())),
        }
    }

    /// Digest of the single layer blob.
    pub fn blob_digest(&self) -> Result<&str, ManifestShapeError> {
        self.single_layer().map(|layer| layer.digest.as_str())
    }
}

/// OCI image index or Docker manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// A fetched manifest document of either shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    Image(Manifest),
    Index(ImageIndex),
}

impl ManifestDocument {
    /// Classify raw manifest bytes.
    ///
    /// A document is an index when its media type says so or when it
    /// carries a `manifests` array.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestShapeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| ManifestShapeError::Malformed(e.to_string()))?;

        let declared_index = value
            .get("mediaType")
            .and_then(|v| v.as_str())
            .is_some_and(is_index_media_type);

        if declared_index || value.get("manifests").is_some() {
            serde_json::from_value(value)
                .map(Self::Index)
                .map_err(|e| ManifestShapeError::Malformed(e.to_string()))
        } else {
            serde_json::from_value(value)
                .map(Self::Image)
                .map_err(|e| ManifestShapeError::Malformed(e.to_string()))
        }
    }
}
