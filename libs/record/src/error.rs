//! Error types for signature records and stage directories.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from parsing or storing signature records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The image reference is not `repo@sha256:<hex>`.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The record directory name disagrees with the digest in IMAGE.
    #[error("record at {path:?} holds {image} but is named {dir_name}")]
    DigestMismatch {
        path: PathBuf,
        image: String,
        dir_name: String,
    },

    /// The signature manifest does not have the expected shape.
    #[error("manifest shape error: {0}")]
    ManifestShape(#[from] ManifestShapeError),

    /// Invalid batch identifier.
    #[error("invalid batch id '{0}'")]
    InvalidBatch(String),

    /// Moving a record between stage roots failed.
    #[error("failed to move record {from:?} to {to:?}: {source}")]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// IO error.
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RecordError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is a failed commit-point move.
    pub fn is_move_failure(&self) -> bool {
        matches!(self, Self::MoveFailed { .. })
    }
}

/// A signature manifest that cannot be handled as a single detached signature.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestShapeError {
    #[error("manifest has no layers, expected exactly one")]
    NoLayers,

    #[error("manifest has {0} layers, expected exactly one")]
    MultipleLayers(usize),

    #[error("malformed manifest: {0}")]
    Malformed(String),
}
