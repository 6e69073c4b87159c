//! In-memory toolchain for testing and development.
//!
//! [`MockToolchain`] implements every external capability against a fake
//! registry held in memory. Signatures are keyed hashes over the signed
//! payload, so a key file `cosign.key` verifies against `cosign.pub` and
//! any byte changed in a stored record breaks verification the way it
//! would with the real tools.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sigstage_record::{
    ImageReference, Manifest, RecordError, RootImage, COSIGN_SIGNATURE_ANNOTATION,
    OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use tracing::{debug, info};

use crate::staging::{
    StagingError, StagingLauncher, StagingRegistry, DEFAULT_STAGING_ADDRESS,
    DEFAULT_STAGING_REPOSITORY,
};
use crate::tool::ToolError;
use crate::tools::{KeySelector, Namespace, SigningTool, Toolchain, TransferTool, VerifyingTool};

const SIMPLE_SIGNING_MEDIA_TYPE: &str = "application/vnd.dev.cosign.simplesigning.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const HARDWARE_KEY_LABEL: &str = "hardware-key";
const ARCHITECTURES: [&str; 4] = ["amd64", "arm64", "ppc64le", "s390x"];

#[derive(Debug, Default)]
struct Repository {
    /// Manifests by digest (`sha256:...`) or tag.
    manifests: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    repositories: HashMap<String, Repository>,
    calls: Vec<String>,
    missing_tools: HashSet<String>,
    failing_signing: HashSet<String>,
    failing_verification: HashSet<String>,
    failing_tags: HashSet<String>,
    signature_layers: HashMap<String, usize>,
    staging_fails: bool,
    images_created: u64,
}

impl State {
    fn repository(&mut self, name: &str) -> &mut Repository {
        self.repositories.entry(name.to_string()).or_default()
    }

    fn manifest(&self, repository: &str, key: &str) -> Option<&Vec<u8>> {
        self.repositories.get(repository)?.manifests.get(key)
    }

    fn image_exists(&self, image: &ImageReference) -> bool {
        self.manifest(image.repository(), &image.digest()).is_some()
    }

    /// Add `count` signature layers to the image's signature manifest.
    fn upload_signature(
        &mut self,
        repository: &str,
        image: &ImageReference,
        payload: &[u8],
        signature: &str,
        count: usize,
    ) {
        let tag = image.signature_tag();
        let mut layers: Vec<Value> = self
            .manifest(repository, &tag)
            .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
            .and_then(|manifest| manifest.get("layers").and_then(Value::as_array).cloned())
            .unwrap_or_default();

        let blob_digest = digest_of(payload);
        for _ in 0..count {
            layers.push(json!({
                "mediaType": SIMPLE_SIGNING_MEDIA_TYPE,
                "digest": blob_digest,
                "size": payload.len(),
                "annotations": { COSIGN_SIGNATURE_ANNOTATION: signature },
            }));
        }

        let config = b"{}".to_vec();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": digest_of(&config),
                "size": config.len(),
            },
            "layers": layers,
        });

        let repo = self.repository(repository);
        repo.blobs.insert(blob_digest, payload.to_vec());
        repo.blobs.insert(digest_of(&config), config);
        repo.manifests.insert(tag, manifest.to_string().into_bytes());
    }
}

/// In-memory registry, signer, verifier, and staging launcher.
pub struct MockToolchain {
    state: Mutex<State>,
    launches: AtomicUsize,
}

impl MockToolchain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            launches: AtomicUsize::new(0),
        }
    }

    /// Repository used by the mock staging registry.
    pub fn staging_repository() -> String {
        format!("{DEFAULT_STAGING_ADDRESS}/{DEFAULT_STAGING_REPOSITORY}")
    }

    /// All capabilities backed by this mock.
    pub fn toolchain(self: &Arc<Self>) -> Toolchain {
        Toolchain {
            signer: self.clone(),
            verifier: self.clone(),
            transfer: self.clone(),
            staging: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a single-platform image to `repository`.
    pub fn add_image(&self, repository: &str) -> Result<ImageReference, RecordError> {
        let mut state = self.state();
        state.images_created += 1;
        let config = json!({ "created": state.images_created }).to_string().into_bytes();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": digest_of(&config),
                "size": config.len(),
            },
            "layers": [],
        })
        .to_string()
        .into_bytes();

        let digest = digest_of(&manifest);
        let repo = state.repository(repository);
        repo.blobs.insert(digest_of(&config), config);
        repo.manifests.insert(digest.clone(), manifest);
        ImageReference::with_digest(repository, &digest)
    }

    /// Publish a manifest list of `platforms` images; returns the list and
    /// its platform images.
    pub fn add_index(
        &self,
        repository: &str,
        platforms: usize,
    ) -> Result<(RootImage, Vec<ImageReference>), RecordError> {
        self.build_index(repository, platforms, true)
    }

    /// Like [`Self::add_index`] but entries omit their media type.
    pub fn add_untyped_index(
        &self,
        repository: &str,
        platforms: usize,
    ) -> Result<(RootImage, Vec<ImageReference>), RecordError> {
        self.build_index(repository, platforms, false)
    }

    /// Publish a manifest list whose second entry is itself a list.
    pub fn add_nested_index(&self, repository: &str) -> Result<RootImage, RecordError> {
        let leaf = self.add_image(repository)?;
        let (inner, _) = self.add_index(repository, 2)?;
        let entries = vec![
            self.index_entry(&leaf, Some(OCI_MANIFEST_MEDIA_TYPE), 0),
            self.index_entry(inner.reference(), Some(OCI_INDEX_MEDIA_TYPE), 1),
        ];
        self.insert_index(repository, entries).map(RootImage::new)
    }

    fn build_index(
        &self,
        repository: &str,
        platforms: usize,
        typed: bool,
    ) -> Result<(RootImage, Vec<ImageReference>), RecordError> {
        let images = (0..platforms)
            .map(|_| self.add_image(repository))
            .collect::<Result<Vec<_>, _>>()?;
        let media_type = typed.then_some(OCI_MANIFEST_MEDIA_TYPE);
        let entries = images
            .iter()
            .enumerate()
            .map(|(i, image)| self.index_entry(image, media_type, i))
            .collect();
        let root = self.insert_index(repository, entries)?;
        Ok((RootImage::new(root), images))
    }

    fn index_entry(&self, image: &ImageReference, media_type: Option<&str>, i: usize) -> Value {
        let size = self
            .state()
            .manifest(image.repository(), &image.digest())
            .map_or(0, Vec::len);
        let mut entry = json!({
            "digest": image.digest(),
            "size": size,
            "platform": {
                "architecture": ARCHITECTURES[i % ARCHITECTURES.len()],
                "os": "linux",
            },
        });
        if let Some(media_type) = media_type {
            entry["mediaType"] = json!(media_type);
        }
        entry
    }

    fn insert_index(
        &self,
        repository: &str,
        entries: Vec<Value>,
    ) -> Result<ImageReference, RecordError> {
        let index = json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX_MEDIA_TYPE,
            "manifests": entries,
        })
        .to_string()
        .into_bytes();
        let digest = digest_of(&index);
        self.state()
            .repository(repository)
            .manifests
            .insert(digest.clone(), index);
        ImageReference::with_digest(repository, &digest)
    }

    /// Report `tool` as missing.
    pub fn without_tool(&self, tool: &str) {
        self.state().missing_tools.insert(tool.to_string());
    }

    pub fn fail_signing_for(&self, image: &ImageReference) {
        self.state().failing_signing.insert(image.to_string());
    }

    pub fn fail_verification_for(&self, image: &ImageReference) {
        self.state().failing_verification.insert(image.to_string());
    }

    pub fn fail_tagging_for(&self, image: &ImageReference) {
        self.state().failing_tags.insert(image.to_string());
    }

    /// Number of signature layers each signing of `image` produces.
    pub fn set_signature_layers(&self, image: &ImageReference, layers: usize) {
        self.state()
            .signature_layers
            .insert(image.to_string(), layers);
    }

    /// Make every staging launch fail.
    pub fn fail_staging(&self) {
        self.state().staging_fails = true;
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls whose description starts with `prefix`.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Digest that `repository:tag` points at.
    pub fn tag_target(&self, repository: &str, tag: &str) -> Option<String> {
        self.state()
            .manifest(repository, tag)
            .map(|bytes| digest_of(bytes))
    }

    /// Stored signature manifest of `image` in `repository`.
    pub fn signature_manifest(&self, repository: &str, image: &ImageReference) -> Option<Vec<u8>> {
        self.state()
            .manifest(repository, &image.signature_tag())
            .cloned()
    }

    fn call(&self, call: String) -> MutexGuard<'_, State> {
        debug!(call = %call, "[MOCK] Tool call");
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    fn check_installed(&self, tool: &str) -> Result<(), ToolError> {
        if self.state().missing_tools.contains(tool) {
            return Err(ToolError::NotInstalled {
                tool: tool.to_string(),
                path: Path::new("assets").join(tool),
            });
        }
        Ok(())
    }
}

impl Default for MockToolchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed signature the mock signer produces and the mock verifier expects.
pub fn mock_signature(key_label: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_label.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn key_label(key: &KeySelector) -> String {
    match key {
        KeySelector::KeyFile(path) => file_stem(path),
        KeySelector::HardwareKey => HARDWARE_KEY_LABEL.to_string(),
    }
}

fn failure(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::failed(tool, "exit status: 1", message)
}

fn read_failure(tool: &str, source: std::io::Error) -> ToolError {
    ToolError::Io {
        tool: tool.to_string(),
        source,
    }
}

/// Split `repo:tag` or `repo@digest`.
fn split_reference(reference: &str) -> Option<(&str, &str)> {
    if let Some(parts) = reference.rsplit_once('@') {
        return Some(parts);
    }
    let (repository, tag) = reference.rsplit_once(':')?;
    (!tag.contains('/')).then_some((repository, tag))
}

/// The staging registry only speaks plain HTTP; everything else only TLS.
fn check_transport(tool: &str, repository: &str, plain_http: bool) -> Result<(), ToolError> {
    let staging = repository.starts_with(DEFAULT_STAGING_ADDRESS);
    match (staging, plain_http) {
        (true, false) => Err(failure(tool, "http: server gave HTTP response to HTTPS client")),
        (false, true) => Err(failure(tool, "plain HTTP refused by remote registry")),
        _ => Ok(()),
    }
}

fn simple_signing_payload(image: &ImageReference) -> Vec<u8> {
    json!({
        "critical": {
            "identity": { "docker-reference": image.repository() },
            "image": { "docker-manifest-digest": image.digest() },
            "type": "cosign container image signature",
        },
        "optional": null,
    })
    .to_string()
    .into_bytes()
}

fn signed_digest(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .pointer("/critical/image/docker-manifest-digest")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl SigningTool for MockToolchain {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        self.check_installed("cosign")
    }

    async fn sign(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        namespace: &Namespace,
    ) -> Result<(), ToolError> {
        let mut state = self.call(format!("sign {image} in {}", namespace.name()));
        if state.failing_signing.contains(&image.to_string()) {
            return Err(failure("cosign", format!("signing {image}: key rejected")));
        }
        if !state.image_exists(image) {
            return Err(failure("cosign", format!("MANIFEST_UNKNOWN: {image}")));
        }

        let payload = simple_signing_payload(image);
        let signature = mock_signature(&key_label(key), &payload);
        let layers = state
            .signature_layers
            .get(&image.to_string())
            .copied()
            .unwrap_or(1);
        state.upload_signature(
            namespace.repository_for(image),
            image,
            &payload,
            &signature,
            layers,
        );

        info!(image = %image, namespace = namespace.name(), "[MOCK] Signed");
        Ok(())
    }

    async fn generate_payload(&self, image: &ImageReference) -> Result<Vec<u8>, ToolError> {
        let state = self.call(format!("generate {image}"));
        if !state.image_exists(image) {
            return Err(failure("cosign", format!("MANIFEST_UNKNOWN: {image}")));
        }
        Ok(simple_signing_payload(image))
    }

    async fn sign_detached(
        &self,
        image: &ImageReference,
        key: &KeySelector,
        payload: &Path,
        signature_out: &Path,
        certificate_out: &Path,
    ) -> Result<(), ToolError> {
        {
            let state = self.call(format!("sign_detached {image}"));
            if state.failing_signing.contains(&image.to_string()) {
                return Err(failure("cosign", format!("signing {image}: key rejected")));
            }
        }

        let payload = tokio::fs::read(payload)
            .await
            .map_err(|e| read_failure("cosign", e))?;
        let label = key_label(key);
        let certificate =
            format!("-----BEGIN CERTIFICATE-----\nmock {label}\n-----END CERTIFICATE-----\n");

        tokio::fs::write(signature_out, mock_signature(&label, &payload))
            .await
            .map_err(|e| read_failure("cosign", e))?;
        tokio::fs::write(certificate_out, certificate)
            .await
            .map_err(|e| read_failure("cosign", e))?;
        Ok(())
    }

    async fn attach(
        &self,
        image: &ImageReference,
        payload: &Path,
        signature: &Path,
        namespace: &Namespace,
    ) -> Result<(), ToolError> {
        let payload = tokio::fs::read(payload)
            .await
            .map_err(|e| read_failure("cosign", e))?;
        let signature = tokio::fs::read_to_string(signature)
            .await
            .map_err(|e| read_failure("cosign", e))?;

        let mut state = self.call(format!("attach {image} in {}", namespace.name()));
        if !state.image_exists(image) {
            return Err(failure("cosign", format!("MANIFEST_UNKNOWN: {image}")));
        }
        state.upload_signature(
            namespace.repository_for(image),
            image,
            &payload,
            signature.trim(),
            1,
        );
        Ok(())
    }
}

#[async_trait]
impl VerifyingTool for MockToolchain {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        self.check_installed("cosign")
    }

    async fn verify(
        &self,
        image: &ImageReference,
        trusted_key: &Path,
        namespace: &Namespace,
    ) -> Result<(), ToolError> {
        let state = self.call(format!("verify {image} in {}", namespace.name()));
        if state.failing_verification.contains(&image.to_string()) {
            return Err(failure("cosign", "no matching signatures: mock failure"));
        }
        if !state.image_exists(image) {
            return Err(failure("cosign", format!("MANIFEST_UNKNOWN: {image}")));
        }

        let repository = namespace.repository_for(image);
        let bytes = state
            .manifest(repository, &image.signature_tag())
            .ok_or_else(|| failure("cosign", "no signatures found"))?;
        let manifest =
            Manifest::from_slice(bytes).map_err(|e| failure("cosign", e.to_string()))?;

        let trusted = file_stem(trusted_key);
        let blobs = state.repositories.get(repository).map(|r| &r.blobs);
        let verified = manifest.layers.iter().any(|layer| {
            let Some(blob) = blobs.and_then(|b| b.get(&layer.digest)) else {
                return false;
            };
            digest_of(blob) == layer.digest
                && signed_digest(blob).as_deref() == Some(image.digest().as_str())
                && layer.annotation(COSIGN_SIGNATURE_ANNOTATION)
                    == Some(mock_signature(&trusted, blob).as_str())
        });

        if verified {
            Ok(())
        } else {
            Err(failure("cosign", "no matching signatures: invalid signature"))
        }
    }
}

#[async_trait]
impl TransferTool for MockToolchain {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        self.check_installed("oras")?;
        self.check_installed("crane")
    }

    async fn fetch_image_manifest(&self, image: &ImageReference) -> Result<Vec<u8>, ToolError> {
        let state = self.call(format!("fetch_image_manifest {image}"));
        state
            .manifest(image.repository(), &image.digest())
            .cloned()
            .ok_or_else(|| failure("crane", format!("MANIFEST_UNKNOWN: {image}")))
    }

    async fn fetch_manifest(
        &self,
        reference: &str,
        plain_http: bool,
    ) -> Result<Vec<u8>, ToolError> {
        let state = self.call(format!("fetch_manifest {reference}"));
        let (repository, key) = split_reference(reference)
            .ok_or_else(|| failure("oras", format!("invalid reference {reference}")))?;
        check_transport("oras", repository, plain_http)?;
        state
            .manifest(repository, key)
            .cloned()
            .ok_or_else(|| failure("oras", format!("{reference}: not found")))
    }

    async fn fetch_blob(
        &self,
        repository: &str,
        digest: &str,
        dest: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError> {
        let blob = {
            let state = self.call(format!("fetch_blob {repository}@{digest}"));
            check_transport("oras", repository, plain_http)?;
            state
                .repositories
                .get(repository)
                .and_then(|r| r.blobs.get(digest))
                .cloned()
                .ok_or_else(|| failure("oras", format!("{repository}@{digest}: not found")))?
        };
        tokio::fs::write(dest, blob)
            .await
            .map_err(|e| read_failure("oras", e))
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        src: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError> {
        let blob = tokio::fs::read(src)
            .await
            .map_err(|e| read_failure("oras", e))?;

        let mut state = self.call(format!("push_blob {repository}@{digest}"));
        check_transport("oras", repository, plain_http)?;
        if digest_of(&blob) != digest {
            return Err(failure("oras", format!("{digest}: digest mismatch")));
        }
        state
            .repository(repository)
            .blobs
            .insert(digest.to_string(), blob);
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &str,
        src: &Path,
        plain_http: bool,
    ) -> Result<(), ToolError> {
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|e| read_failure("oras", e))?;

        let mut state = self.call(format!("push_manifest {reference}"));
        let (repository, tag) = split_reference(reference)
            .ok_or_else(|| failure("oras", format!("invalid reference {reference}")))?;
        check_transport("oras", repository, plain_http)?;

        let manifest =
            Manifest::from_slice(&bytes).map_err(|e| failure("oras", e.to_string()))?;
        let repo = state.repository(repository);
        if let Some(missing) = manifest
            .layers
            .iter()
            .find(|layer| !repo.blobs.contains_key(&layer.digest))
        {
            return Err(failure("oras", format!("BLOB_UNKNOWN: {}", missing.digest)));
        }
        repo.manifests.insert(tag.to_string(), bytes);
        Ok(())
    }

    async fn tag(&self, image: &ImageReference, tag: &str) -> Result<(), ToolError> {
        let mut state = self.call(format!("tag {image} {tag}"));
        if state.failing_tags.contains(&image.to_string()) {
            return Err(failure("crane", format!("tagging {image}: denied")));
        }
        let manifest = state
            .manifest(image.repository(), &image.digest())
            .cloned()
            .ok_or_else(|| failure("crane", format!("MANIFEST_UNKNOWN: {image}")))?;
        state
            .repository(image.repository())
            .manifests
            .insert(tag.to_string(), manifest);
        Ok(())
    }
}

#[async_trait]
impl StagingLauncher for MockToolchain {
    fn ensure_installed(&self) -> Result<(), ToolError> {
        self.check_installed("crane")
    }

    async fn launch(&self) -> Result<StagingRegistry, StagingError> {
        let repository = Self::staging_repository();
        {
            let mut state = self.call("launch staging".to_string());
            if state.staging_fails {
                return Err(StagingError::Exited("exit status: 1".to_string()));
            }
            state.repositories.remove(&repository);
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        Ok(StagingRegistry::unmanaged(
            SocketAddr::from(([127, 0, 0, 1], 7777)),
            repository,
        ))
    }
}
