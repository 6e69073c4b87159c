//! Digest-pinned image references.
//!
//! Every image handled by sigstage is addressed by content, never by a
//! mutable tag: `registry.example/app@sha256:<64 hex>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Separator between repository and digest.
const DIGEST_SEPARATOR: &str = "@sha256:";

/// Length of a hex-encoded SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// A repository path plus a SHA-256 content digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    repository: String,
    digest_hex: String,
}

impl ImageReference {
    /// Parse a `repo@sha256:<hex>` reference.
    pub fn parse(reference: &str) -> Result<Self, RecordError> {
        let reference = reference.trim();
        let Some((repository, digest_hex)) = reference.rsplit_once(DIGEST_SEPARATOR) else {
            return Err(RecordError::invalid_reference(
                reference,
                "should contain a sha256 digest",
            ));
        };

        if repository.is_empty() {
            return Err(RecordError::invalid_reference(reference, "empty repository"));
        }

        // A colon in the last path segment is a tag. Ports only appear in a
        // registry host, which is never the whole repository.
        let last_segment = repository.rsplit('/').next().unwrap_or(repository);
        if last_segment.contains(':') {
            return Err(RecordError::invalid_reference(
                reference,
                "tags are not allowed alongside a digest",
            ));
        }

        Self::from_parts(repository, digest_hex)
            .map_err(|reason| RecordError::invalid_reference(reference, reason))
    }

    /// Pair a repository with a digest of the form `sha256:<hex>`.
    pub fn with_digest(repository: &str, digest: &str) -> Result<Self, RecordError> {
        let reference = format!("{repository}@{digest}");
        let Some(digest_hex) = digest.strip_prefix("sha256:") else {
            return Err(RecordError::invalid_reference(
                &reference,
                "only sha256 digests are supported",
            ));
        };
        Self::from_parts(repository, digest_hex)
            .map_err(|reason| RecordError::invalid_reference(&reference, reason))
    }

    fn from_parts(repository: &str, digest_hex: &str) -> Result<Self, String> {
        if digest_hex.len() != DIGEST_HEX_LEN {
            return Err(format!(
                "digest must be {DIGEST_HEX_LEN} hex characters, got {}",
                digest_hex.len()
            ));
        }
        if !digest_hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err("digest must be lowercase hex".to_string());
        }

        Ok(Self {
            repository: repository.to_string(),
            digest_hex: digest_hex.to_string(),
        })
    }

    /// Repository path, e.g. `registry.example/app`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Hex digest without the algorithm prefix.
    pub fn digest_hex(&self) -> &str {
        &self.digest_hex
    }

    /// Digest with its algorithm prefix, e.g. `sha256:abc...`.
    pub fn digest(&self) -> String {
        format!("sha256:{}", self.digest_hex)
    }

    /// Tag under which cosign stores the signature manifest for this image.
    pub fn signature_tag(&self) -> String {
        format!("sha256-{}.sig", self.digest_hex)
    }

    /// Reference to this image's signature manifest inside `repository`.
    pub fn signature_reference_in(&self, repository: &str) -> String {
        format!("{}:{}", repository, self.signature_tag())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.repository, DIGEST_SEPARATOR, self.digest_hex)
    }
}

impl FromStr for ImageReference {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageReference {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageReference> for String {
    fn from(value: ImageReference) -> Self {
        value.to_string()
    }
}

/// An image given directly by the operator; may be a multi-platform list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootImage(ImageReference);

impl RootImage {
    pub fn new(reference: ImageReference) -> Self {
        Self(reference)
    }

    pub fn reference(&self) -> &ImageReference {
        &self.0
    }

    /// Build a platform sub-image that shares this image's repository.
    pub fn platform(&self, digest: &str) -> Result<PlatformImage, RecordError> {
        ImageReference::with_digest(self.0.repository(), digest).map(PlatformImage)
    }
}

impl FromStr for RootImage {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(s).map(Self)
    }
}

impl fmt::Display for RootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A per-platform sub-image listed by a root image's manifest list.
///
/// Platform images are always signing leaves: there is no way to expand
/// one into further sub-images.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformImage(ImageReference);

impl PlatformImage {
    pub fn reference(&self) -> &ImageReference {
        &self.0
    }

    pub fn into_reference(self) -> ImageReference {
        self.0
    }
}

impl fmt::Display for PlatformImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
