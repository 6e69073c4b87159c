//! Signing an image and capturing the result in its record.
//!
//! Signing happens in two steps so the pipeline can verify in between:
//! [`SigningGateway::sign`] writes the signature into a namespace (and, in
//! detached mode, into pending files of the record), and
//! [`SigningGateway::retrieve`] writes the commit artifact that makes the
//! record complete. [`SigningGateway::push`] later replays a complete
//! record into another namespace.

use std::sync::Arc;

use sigstage_record::{Manifest, RecordMode, SignatureRecord};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::tool::ToolError;
use crate::tools::{KeySelector, Namespace, SigningMode, SigningTool, TransferTool};

pub struct SigningGateway {
    signer: Arc<dyn SigningTool>,
    transfer: Arc<dyn TransferTool>,
}

impl SigningGateway {
    pub fn new(signer: Arc<dyn SigningTool>, transfer: Arc<dyn TransferTool>) -> Self {
        Self { signer, transfer }
    }

    /// Sign the record's image into `namespace`.
    pub async fn sign(
        &self,
        record: &SignatureRecord,
        key: &KeySelector,
        mode: SigningMode,
        namespace: &Namespace,
    ) -> Result<(), PipelineError> {
        let image = record.image();
        match mode {
            SigningMode::RegistryAttached => {
                self.signer
                    .sign(image, key, namespace)
                    .await
                    .map_err(|e| signing_failed(image, e))?;
            }
            SigningMode::Detached => {
                let payload = self
                    .signer
                    .generate_payload(image)
                    .await
                    .map_err(|e| signing_failed(image, e))?;
                record.write_payload(&payload)?;

                self.signer
                    .sign_detached(
                        image,
                        key,
                        &record.payload_file(),
                        &record.pending_signature_file(),
                        &record.certificate_file(),
                    )
                    .await
                    .map_err(|e| signing_failed(image, e))?;

                self.signer
                    .attach(
                        image,
                        &record.payload_file(),
                        &record.pending_signature_file(),
                        namespace,
                    )
                    .await?;
            }
        }

        info!(image = %image, namespace = %namespace, "Image signed");
        Ok(())
    }

    /// Capture the signature artifacts into the record and complete it.
    ///
    /// For registry-attached signatures the manifest's shape is checked
    /// before its blob is fetched; a manifest without exactly one layer
    /// leaves the record incomplete.
    pub async fn retrieve(
        &self,
        record: &SignatureRecord,
        mode: SigningMode,
        namespace: &Namespace,
    ) -> Result<(), PipelineError> {
        let image = record.image();
        match mode {
            SigningMode::RegistryAttached => {
                let repository = namespace.repository_for(image);
                let reference = image.signature_reference_in(repository);
                let plain_http = namespace.plain_http();

                let bytes = self.transfer.fetch_manifest(&reference, plain_http).await?;
                let manifest = Manifest::from_slice(&bytes)
                    .map_err(|e| PipelineError::manifest_shape(image, e))?;
                let blob_digest = manifest
                    .blob_digest()
                    .map_err(|e| PipelineError::manifest_shape(image, e))?;

                debug!(image = %image, blob = blob_digest, "Fetching signature blob");
                self.transfer
                    .fetch_blob(repository, blob_digest, &record.blob_file(), plain_http)
                    .await?;
                record.commit_manifest(&bytes)?;
            }
            SigningMode::Detached => record.commit_signature()?,
        }

        debug!(image = %image, path = %record.path().display(), "Record committed");
        Ok(())
    }

    /// Replay a complete record's artifacts into `namespace`.
    ///
    /// Registry-attached records push the blob, then the manifest under the
    /// image's signature tag. The manifest shape is checked before anything
    /// is pushed. Detached records are attached from their stored files.
    pub async fn push(
        &self,
        record: &SignatureRecord,
        namespace: &Namespace,
    ) -> Result<(), PipelineError> {
        let image = record.image();
        let mode = record
            .mode()
            .ok_or_else(|| PipelineError::IncompleteRecord {
                path: record.path().to_path_buf(),
            })?;

        match mode {
            RecordMode::RegistryAttached => {
                let manifest = record
                    .manifest()
                    .map_err(|e| PipelineError::from_record(image, e))?;
                let blob_digest = manifest
                    .blob_digest()
                    .map_err(|e| PipelineError::manifest_shape(image, e))?;

                let repository = namespace.repository_for(image);
                let plain_http = namespace.plain_http();
                self.transfer
                    .push_blob(repository, blob_digest, &record.blob_file(), plain_http)
                    .await?;
                self.transfer
                    .push_manifest(
                        &image.signature_reference_in(repository),
                        &record.manifest_file(),
                        plain_http,
                    )
                    .await?;
            }
            RecordMode::Detached => {
                self.signer
                    .attach(
                        image,
                        &record.payload_file(),
                        &record.signature_file(),
                        namespace,
                    )
                    .await?;
            }
        }

        info!(image = %image, namespace = %namespace, "Signature pushed");
        Ok(())
    }
}

fn signing_failed(image: impl ToString, err: ToolError) -> PipelineError {
    match err {
        ToolError::Failed { diagnostics, .. } => PipelineError::SigningFailed {
            image: image.to_string(),
            diagnostics,
        },
        other => other.into(),
    }
}
