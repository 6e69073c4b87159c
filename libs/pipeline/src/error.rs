//! Pipeline error type.

use std::path::PathBuf;

use sigstage_record::{ManifestShapeError, RecordError};
use thiserror::Error;

use crate::staging::StagingError;
use crate::tool::ToolError;

/// Errors from a prepare, verify, or publish run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Operator input is contradictory or incomplete.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required external tool is missing.
    #[error("{tool} is not installed at {path:?}")]
    NotInstalled { tool: String, path: PathBuf },

    /// A manifest list entry is itself a list.
    #[error("unsupported manifest shape for {image}: {reason}")]
    UnsupportedManifestShape { image: String, reason: String },

    /// The signature manifest does not carry exactly one layer.
    #[error("signature manifest for {image}: {source}")]
    ManifestShape {
        image: String,
        #[source]
        source: ManifestShapeError,
    },

    #[error("signing {image} failed: {diagnostics}")]
    SigningFailed { image: String, diagnostics: String },

    #[error("verification of {image} in {namespace} failed: {diagnostics}")]
    VerificationFailed {
        image: String,
        namespace: String,
        diagnostics: String,
    },

    /// Any other external tool failure.
    #[error(transparent)]
    ExternalTool(ToolError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    /// The commit-point move failed; the record stays where it was.
    #[error(transparent)]
    MoveFailed(RecordError),

    #[error(transparent)]
    Store(RecordError),

    /// A listed record lost part of its artifact set.
    #[error("record at {path:?} is incomplete")]
    IncompleteRecord { path: PathBuf },

    /// A record state change that the lifecycle does not allow.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl PipelineError {
    /// Errors that abort a run instead of failing a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::NotInstalled { .. } | Self::Staging(_)
        )
    }
}

impl From<ToolError> for PipelineError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotInstalled { tool, path } => Self::NotInstalled { tool, path },
            other => Self::ExternalTool(other),
        }
    }
}

impl From<RecordError> for PipelineError {
    fn from(err: RecordError) -> Self {
        if err.is_move_failure() {
            Self::MoveFailed(err)
        } else {
            Self::Store(err)
        }
    }
}

impl PipelineError {
    pub(crate) fn manifest_shape(image: impl ToString, source: ManifestShapeError) -> Self {
        Self::ManifestShape {
            image: image.to_string(),
            source,
        }
    }

    /// Attribute a record-store error to `image`, keeping shape errors typed.
    pub(crate) fn from_record(image: impl ToString, err: RecordError) -> Self {
        match err {
            RecordError::ManifestShape(source) => Self::manifest_shape(image, source),
            other => other.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_maps_to_not_installed() {
        let err: PipelineError = ToolError::NotInstalled {
            tool: "cosign".into(),
            path: "/assets/cosign".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::NotInstalled { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn tool_failure_is_not_fatal() {
        let err: PipelineError = ToolError::failed("oras", "exit status: 1", "denied").into();
        assert!(matches!(err, PipelineError::ExternalTool(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn move_failure_keeps_its_kind() {
        let err: PipelineError = RecordError::MoveFailed {
            from: "a".into(),
            to: "b".into(),
            source: std::io::Error::other("cross-device"),
        }
        .into();
        assert!(matches!(err, PipelineError::MoveFailed(_)));
    }
}
