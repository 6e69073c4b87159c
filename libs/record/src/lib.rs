//! # sigstage-record
//!
//! Durable representation of pending and published image signatures.
//!
//! ## Layout
//!
//! ```text
//! SIGNATURES/                  prepared stage root
//!   20250101T120000Z/          batch (sortable UTC timestamp)
//!     <digest>/                one signature record
//!       IMAGE MANIFEST BLOB LATEST
//! PUBLISHED/                   published stage root, same shape
//! ```
//!
//! A record's directory is its state. Records are created in the prepared
//! root, read during verification, and moved into the published root once
//! the real repository accepted and verified them. Nothing here deletes a
//! record.

mod error;
mod image;
mod manifest;
mod record;
mod store;

pub use error::{ManifestShapeError, RecordError};
pub use image::{ImageReference, PlatformImage, RootImage};
pub use manifest::{
    is_index_media_type, Descriptor, ImageIndex, Manifest, ManifestDocument,
    COSIGN_SIGNATURE_ANNOTATION, DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
pub use record::{
    BatchId, RecordMode, SignatureRecord, Stage, BLOB_FILE, CERTIFICATE_FILE, IMAGE_FILE,
    LATEST_FILE, MANIFEST_FILE, PAYLOAD_FILE, SIGNATURE_FILE,
};
pub use store::{BatchScope, Layout, RecordGroup, RecordStore, Records};
