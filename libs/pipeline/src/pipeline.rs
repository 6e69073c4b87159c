//! Prepare, verify, and publish runs.
//!
//! Every run attempts each record and reports one outcome per record. A
//! failing record never stops its siblings; only fatal errors (bad
//! configuration, missing tools, no staging registry) abort the run.

use std::path::PathBuf;

use sigstage_record::{
    BatchId, BatchScope, ImageReference, Layout, RecordStore, RootImage, SignatureRecord,
};
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::resolver::ManifestResolver;
use crate::signing::SigningGateway;
use crate::state::{Operation, RecordOutcome, RecordState, RunReport};
use crate::tools::{KeySelector, Namespace, SigningMode, Toolchain};
use crate::verification::VerificationGateway;

/// Tag moved to the newest batch's latest image on publish.
pub const LATEST_TAG: &str = "latest";

/// Input of a prepare run.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub image: RootImage,
    pub key: KeySelector,
    /// Also sign the platform images of a manifest list.
    pub recursive: bool,
    pub mode: SigningMode,
    /// Batch to create or resume; a new one is started when unset.
    pub batch: Option<BatchId>,
}

impl PrepareRequest {
    pub fn new(image: RootImage, key: KeySelector) -> Self {
        Self {
            image,
            key,
            recursive: true,
            mode: SigningMode::default(),
            batch: None,
        }
    }
}

/// Sequences signing, staging verification, and publishing.
pub struct PublishPipeline {
    toolchain: Toolchain,
    resolver: ManifestResolver,
    signing: SigningGateway,
    verification: VerificationGateway,
}

impl PublishPipeline {
    pub fn new(toolchain: Toolchain, trusted_key: impl Into<PathBuf>) -> Self {
        Self {
            resolver: ManifestResolver::new(toolchain.transfer.clone()),
            signing: SigningGateway::new(toolchain.signer.clone(), toolchain.transfer.clone()),
            verification: VerificationGateway::new(toolchain.verifier.clone(), trusted_key),
            toolchain,
        }
    }

    /// Sign the image (and its platform images) into `store`.
    ///
    /// Each record is signed into the staging registry, verified there, and
    /// only then committed. Complete records already in the batch are kept.
    pub async fn prepare(
        &self,
        request: &PrepareRequest,
        store: &RecordStore,
    ) -> Result<RunReport, PipelineError> {
        self.toolchain.ensure_installed()?;

        let batch = match (store.layout(), &request.batch) {
            (Layout::Batched, Some(batch)) => Some(batch.clone()),
            (Layout::Batched, None) => Some(BatchId::now()),
            (Layout::Flat, None) => None,
            (Layout::Flat, Some(_)) => {
                return Err(PipelineError::Configuration(
                    "a batch cannot be selected for a flat signatures directory".to_string(),
                ))
            }
        };

        let platforms = if request.recursive {
            self.resolver.resolve(&request.image).await?
        } else {
            Vec::new()
        };

        let mut images = Vec::with_capacity(platforms.len() + 1);
        images.push(request.image.reference().clone());
        images.extend(platforms.into_iter().map(|p| p.into_reference()));

        info!(
            image = %request.image,
            records = images.len(),
            batch = batch.as_ref().map(BatchId::as_str),
            "Preparing signatures"
        );

        let staging = self.toolchain.staging.launch().await?;
        let namespace = staging.namespace();

        let result = self
            .prepare_all(request, store, batch.as_ref(), &images, &namespace)
            .await;

        staging.shutdown().await;
        result
    }

    async fn prepare_all(
        &self,
        request: &PrepareRequest,
        store: &RecordStore,
        batch: Option<&BatchId>,
        images: &[ImageReference],
        namespace: &Namespace,
    ) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(Operation::Prepare);

        for (index, image) in images.iter().enumerate() {
            let is_root = index == 0;
            let mut state = RecordState::Pending;

            let result = self
                .prepare_record(request, store, batch, image, is_root, namespace, &mut state)
                .await;

            let mut outcome = RecordOutcome::new(image, batch.cloned(), RecordState::Pending);
            match result {
                Ok(reused) => outcome.reused = reused,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(image = %image, error = %e, "Prepare failed for record");
                    state.fail(e.to_string());
                }
            }
            outcome.state = state;
            report.push(outcome);
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_record(
        &self,
        request: &PrepareRequest,
        store: &RecordStore,
        batch: Option<&BatchId>,
        image: &ImageReference,
        is_root: bool,
        namespace: &Namespace,
        state: &mut RecordState,
    ) -> Result<bool, PipelineError> {
        if let Some(existing) = store.find(image, batch)? {
            info!(
                image = %image,
                path = %existing.path().display(),
                "Record already prepared, skipping"
            );
            // Only verified records are ever committed.
            *state = RecordState::StagingVerified;
            return Ok(true);
        }

        let record = store.create(image, batch)?;

        self.signing
            .sign(&record, &request.key, request.mode, namespace)
            .await?;
        state.advance(RecordState::Prepared)?;

        self.verification.verify(image, namespace).await?;
        state.advance(RecordState::StagingVerified)?;

        if is_root {
            record.mark_latest()?;
        }
        self.signing.retrieve(&record, request.mode, namespace).await?;

        info!(image = %image, path = %record.path().display(), "Record prepared");
        Ok(false)
    }

    /// Re-check prepared records against a fresh staging registry.
    ///
    /// Records are pushed to staging and verified there; nothing on disk
    /// changes. Returns an empty report without starting the registry when
    /// there is nothing to check.
    pub async fn verify(
        &self,
        store: &RecordStore,
        scope: BatchScope,
    ) -> Result<RunReport, PipelineError> {
        self.toolchain.ensure_installed()?;

        let mut report = RunReport::new(Operation::Verify);
        let mut records = Vec::new();
        for group in store.groups(scope)? {
            for entry in store.list(group.batch.as_ref())? {
                match entry {
                    Ok(record) => records.push(record),
                    Err(e) => report.push(unreadable(group.batch.clone(), e.into())),
                }
            }
        }

        if records.is_empty() {
            info!(root = %store.root().display(), "No records to verify");
            return Ok(report);
        }

        let staging = self.toolchain.staging.launch().await?;
        let namespace = staging.namespace();

        for record in &records {
            let mut state = RecordState::Prepared;
            if let Err(e) = self.verify_record(record, &namespace, &mut state).await {
                warn!(image = %record.image(), error = %e, "Record failed verification");
                state.fail(e.to_string());
            }
            report.push(RecordOutcome::new(
                record.image(),
                record.batch().cloned(),
                state,
            ));
        }

        staging.shutdown().await;
        Ok(report)
    }

    async fn verify_record(
        &self,
        record: &SignatureRecord,
        namespace: &Namespace,
        state: &mut RecordState,
    ) -> Result<(), PipelineError> {
        self.signing.push(record, namespace).await?;
        self.verification.verify(record.image(), namespace).await?;
        state.advance(RecordState::StagingVerified)
    }

    /// Push prepared records to their repositories and move them to
    /// `destination` once verified there.
    ///
    /// The `latest` tag is only moved for the flagged record of the newest
    /// batch, never for older batches processed by the same run.
    pub async fn publish(
        &self,
        source: &RecordStore,
        destination: &RecordStore,
        scope: BatchScope,
    ) -> Result<RunReport, PipelineError> {
        self.toolchain.ensure_installed()?;

        let mut report = RunReport::new(Operation::Publish);

        for group in source.groups(scope)? {
            let entries: Vec<_> = source.list(group.batch.as_ref())?.collect();
            info!(
                batch = group.batch.as_ref().map(BatchId::as_str),
                newest = group.newest,
                records = entries.len(),
                "Publishing batch"
            );

            for entry in entries {
                let record = match entry {
                    Ok(record) => record,
                    Err(e) => {
                        report.push(unreadable(group.batch.clone(), e.into()));
                        continue;
                    }
                };

                let mut state = RecordState::StagingVerified;
                let result = self
                    .publish_record(&record, group.newest, source, destination, &mut state)
                    .await;

                let mut outcome =
                    RecordOutcome::new(record.image(), record.batch().cloned(), RecordState::Pending);
                match result {
                    Ok(tagged) => outcome.tagged_latest = tagged,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        error!(image = %record.image(), error = %e, "Publish failed for record");
                        state.fail(e.to_string());
                    }
                }
                outcome.state = state;
                report.push(outcome);
            }
        }

        if report.outcomes.is_empty() {
            info!(root = %source.root().display(), "No records to publish");
        }
        Ok(report)
    }

    async fn publish_record(
        &self,
        record: &SignatureRecord,
        newest_batch: bool,
        source: &RecordStore,
        destination: &RecordStore,
        state: &mut RecordState,
    ) -> Result<bool, PipelineError> {
        let image = record.image();

        self.signing.push(record, &Namespace::Target).await?;
        state.advance(RecordState::Pushed)?;

        self.verification.verify(image, &Namespace::Target).await?;
        state.advance(RecordState::TargetVerified)?;

        let tagged = newest_batch && record.is_latest();
        if tagged {
            self.toolchain.transfer.tag(image, LATEST_TAG).await?;
            info!(image = %image, tag = LATEST_TAG, "Tag updated");
        }

        let mut published = state.clone();
        published.advance(RecordState::Published)?;
        let moved = source.move_record(record, destination)?;
        *state = published;

        info!(image = %image, path = %moved.path().display(), "Record published");
        Ok(tagged)
    }
}

/// Outcome for a directory that could not be loaded as a record.
fn unreadable(batch: Option<BatchId>, err: PipelineError) -> RecordOutcome {
    warn!(error = %err, "Unreadable record");
    RecordOutcome::new("<unreadable>", batch, RecordState::Failed(err.to_string()))
}
