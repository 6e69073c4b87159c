//! A single signature record on disk.
//!
//! A record is a directory named by the image digest:
//!
//! ```text
//! <digest>/
//!   IMAGE          full image reference (always written first)
//!   LATEST         optional zero-byte marker
//!   BLOB           signature blob            (registry-attached)
//!   MANIFEST       signature manifest        (registry-attached, commit artifact)
//!   payload.json   signing payload           (detached)
//!   certificate    signing certificate       (detached)
//!   signature      detached signature        (detached, commit artifact)
//! ```
//!
//! The commit artifact is always renamed into place last, so a record is
//! either complete or invisible to listing.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::image::ImageReference;
use crate::manifest::Manifest;

pub const IMAGE_FILE: &str = "IMAGE";
pub const MANIFEST_FILE: &str = "MANIFEST";
pub const BLOB_FILE: &str = "BLOB";
pub const PAYLOAD_FILE: &str = "payload.json";
pub const SIGNATURE_FILE: &str = "signature";
pub const CERTIFICATE_FILE: &str = "certificate";
pub const LATEST_FILE: &str = "LATEST";

/// Detached signatures are produced here and renamed to `signature` on commit.
const PENDING_SIGNATURE_FILE: &str = "signature.partial";

/// Pipeline stage a record is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Signed and verified against the staging registry, not yet published.
    Prepared,
    /// Re-verified against the staging registry.
    ///
    /// Never stored on disk: a verify run reports this as a per-run state
    /// and leaves records in the prepared root.
    Verified,
    /// Pushed to and verified against the real repository.
    Published,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Verified => "verified",
            Self::Published => "published",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which artifact set a complete record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    /// MANIFEST + BLOB fetched back from a registry.
    RegistryAttached,
    /// payload.json + signature + certificate.
    Detached,
}

/// Identifier of a batch directory: a sortable UTC timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchId(String);

impl BatchId {
    /// Timestamp format; lexical order matches chronological order.
    pub const FORMAT: &'static str = "%Y%m%dT%H%M%SZ";

    /// A batch id for the current time.
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self(time.format(Self::FORMAT).to_string())
    }

    /// Accept an existing batch directory name.
    pub fn parse(name: &str) -> Result<Self, RecordError> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(RecordError::InvalidBatch(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BatchId {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BatchId> for String {
    fn from(value: BatchId) -> Self {
        value.0
    }
}

/// One image's signing artifacts and its location in a stage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    image: ImageReference,
    path: PathBuf,
    stage: Stage,
    batch: Option<BatchId>,
}

impl SignatureRecord {
    pub(crate) fn new(
        image: ImageReference,
        path: PathBuf,
        stage: Stage,
        batch: Option<BatchId>,
    ) -> Self {
        Self {
            image,
            path,
            stage,
            batch,
        }
    }

    /// Load the record stored in `dir`.
    ///
    /// Returns `Ok(None)` when the directory does not hold a complete record.
    pub fn load(dir: &Path, stage: Stage, batch: Option<BatchId>) -> Result<Option<Self>, RecordError> {
        let image_file = dir.join(IMAGE_FILE);
        if !image_file.is_file() {
            return Ok(None);
        }

        let contents =
            fs::read_to_string(&image_file).map_err(|e| RecordError::io(&image_file, e))?;
        let image = ImageReference::parse(&contents)?;

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if dir_name != image.digest_hex() {
            return Err(RecordError::DigestMismatch {
                path: dir.to_path_buf(),
                image: image.to_string(),
                dir_name,
            });
        }

        let record = Self::new(image, dir.to_path_buf(), stage, batch);
        Ok(record.mode().is_some().then_some(record))
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    /// Hex digest; always equal to the record directory name.
    pub fn digest(&self) -> &str {
        self.image.digest_hex()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn batch(&self) -> Option<&BatchId> {
        self.batch.as_ref()
    }

    /// Whether this is the most recent signed image of its batch.
    pub fn is_latest(&self) -> bool {
        self.latest_file().is_file()
    }

    /// The artifact set present on disk, if complete.
    pub fn mode(&self) -> Option<RecordMode> {
        let present = |name: &str| self.path.join(name).is_file();
        if !present(IMAGE_FILE) {
            return None;
        }
        if present(MANIFEST_FILE) && present(BLOB_FILE) {
            Some(RecordMode::RegistryAttached)
        } else if present(PAYLOAD_FILE) && present(SIGNATURE_FILE) && present(CERTIFICATE_FILE) {
            Some(RecordMode::Detached)
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.mode().is_some()
    }

    pub fn image_file(&self) -> PathBuf {
        self.path.join(IMAGE_FILE)
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    pub fn blob_file(&self) -> PathBuf {
        self.path.join(BLOB_FILE)
    }

    pub fn payload_file(&self) -> PathBuf {
        self.path.join(PAYLOAD_FILE)
    }

    pub fn signature_file(&self) -> PathBuf {
        self.path.join(SIGNATURE_FILE)
    }

    /// Where a detached signature is written before it is committed.
    pub fn pending_signature_file(&self) -> PathBuf {
        self.path.join(PENDING_SIGNATURE_FILE)
    }

    pub fn certificate_file(&self) -> PathBuf {
        self.path.join(CERTIFICATE_FILE)
    }

    pub fn latest_file(&self) -> PathBuf {
        self.path.join(LATEST_FILE)
    }

    /// Read and parse the stored signature manifest.
    pub fn manifest(&self) -> Result<Manifest, RecordError> {
        let path = self.manifest_file();
        let bytes = fs::read(&path).map_err(|e| RecordError::io(&path, e))?;
        Ok(Manifest::from_slice(&bytes)?)
    }

    /// Digest of the manifest's single blob layer.
    pub fn blob_digest(&self) -> Result<String, RecordError> {
        let manifest = self.manifest()?;
        Ok(manifest.blob_digest()?.to_string())
    }

    pub fn write_blob(&self, bytes: &[u8]) -> Result<(), RecordError> {
        write_atomic(&self.blob_file(), bytes)
    }

    pub fn write_payload(&self, bytes: &[u8]) -> Result<(), RecordError> {
        write_atomic(&self.payload_file(), bytes)
    }

    /// Flag this record as the newest signed image of its batch.
    pub fn mark_latest(&self) -> Result<(), RecordError> {
        let path = self.latest_file();
        fs::File::create(&path)
            .map(|_| ())
            .map_err(|e| RecordError::io(&path, e))
    }

    /// Write MANIFEST, completing a registry-attached record.
    pub fn commit_manifest(&self, bytes: &[u8]) -> Result<(), RecordError> {
        write_atomic(&self.manifest_file(), bytes)
    }

    /// Move the pending detached signature into place, completing the record.
    pub fn commit_signature(&self) -> Result<(), RecordError> {
        let from = self.pending_signature_file();
        let to = self.signature_file();
        fs::rename(&from, &to).map_err(|e| RecordError::io(&from, e))
    }
}

/// Write through a temp file and rename so readers never see partial content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecordError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| RecordError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| RecordError::io(&tmp, e))?;
    file.sync_all().map_err(|e| RecordError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| RecordError::io(path, e))
}
