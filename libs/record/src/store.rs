//! Filesystem-backed stage roots.
//!
//! A record's location is its state: moving a record directory from the
//! prepared root into the published root is the only commit point. The
//! move is a single `rename`, so a scanner never observes a record under
//! two roots at once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::RecordError;
use crate::image::ImageReference;
use crate::record::{write_atomic, BatchId, SignatureRecord, Stage, IMAGE_FILE};

/// How records are arranged under a stage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `<root>/<digest>/`
    Flat,
    /// `<root>/<batch>/<digest>/`
    Batched,
}

/// Which batches a scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchScope {
    /// Only the newest batch.
    #[default]
    Newest,
    /// Every batch, newest first.
    All,
}

/// A group of records scanned together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordGroup {
    /// Batch directory, or `None` for a flat root.
    pub batch: Option<BatchId>,
    /// True for the newest batch of the root (always true for a flat root).
    pub newest: bool,
}

/// A stage root holding signature records.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
    stage: Stage,
    layout: Layout,
}

impl RecordStore {
    pub fn batched(root: impl Into<PathBuf>, stage: Stage) -> Self {
        Self {
            root: root.into(),
            stage,
            layout: Layout::Batched,
        }
    }

    pub fn flat(root: impl Into<PathBuf>, stage: Stage) -> Self {
        Self {
            root: root.into(),
            stage,
            layout: Layout::Flat,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    fn group_dir(&self, batch: Option<&BatchId>) -> Result<PathBuf, RecordError> {
        match (self.layout, batch) {
            (Layout::Flat, None) => Ok(self.root.clone()),
            (Layout::Batched, Some(batch)) => Ok(self.root.join(batch.as_str())),
            (Layout::Flat, Some(batch)) => Err(RecordError::InvalidBatch(format!(
                "{batch} (flat root {:?} has no batches)",
                self.root
            ))),
            (Layout::Batched, None) => Err(RecordError::InvalidBatch(format!(
                "<none> (batched root {:?} requires a batch)",
                self.root
            ))),
        }
    }

    /// Directory a record for `image` occupies in this root.
    pub fn record_dir(
        &self,
        image: &ImageReference,
        batch: Option<&BatchId>,
    ) -> Result<PathBuf, RecordError> {
        Ok(self.group_dir(batch)?.join(image.digest_hex()))
    }

    /// Allocate the record directory for `image` and write its IMAGE file.
    ///
    /// Re-running on an existing directory keeps whatever artifacts are
    /// already there; a complete record for a different reference with the
    /// same digest is left untouched and reported as a conflict.
    pub fn create(
        &self,
        image: &ImageReference,
        batch: Option<&BatchId>,
    ) -> Result<SignatureRecord, RecordError> {
        let dir = self.record_dir(image, batch)?;
        fs::create_dir_all(&dir).map_err(|e| RecordError::io(&dir, e))?;

        let record = SignatureRecord::new(image.clone(), dir.clone(), self.stage, batch.cloned());
        let image_file = dir.join(IMAGE_FILE);
        let existing = fs::read_to_string(&image_file).ok();

        match existing {
            Some(current) if current.trim() == image.to_string() => {
                debug!(image = %image, path = %dir.display(), "Record directory already exists");
            }
            Some(current) if record.is_complete() => {
                return Err(RecordError::invalid_reference(
                    &image.to_string(),
                    format!("digest already recorded for {}", current.trim()),
                ));
            }
            _ => {
                write_atomic(&image_file, image.to_string().as_bytes())?;
                debug!(image = %image, path = %dir.display(), "Record created");
            }
        }

        Ok(record)
    }

    /// The complete record for `image`, if one exists.
    pub fn find(
        &self,
        image: &ImageReference,
        batch: Option<&BatchId>,
    ) -> Result<Option<SignatureRecord>, RecordError> {
        let dir = self.record_dir(image, batch)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        SignatureRecord::load(&dir, self.stage, batch.cloned())
    }

    /// Lazily enumerate complete records of one group.
    ///
    /// Non-directory entries and partially written records are skipped. A
    /// missing directory yields nothing.
    pub fn list(&self, batch: Option<&BatchId>) -> Result<Records, RecordError> {
        let dir = self.group_dir(batch)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(RecordError::io(&dir, e)),
        };

        Ok(Records {
            dir,
            entries,
            stage: self.stage,
            batch: batch.cloned(),
        })
    }

    /// Batch ids of a batched root, newest first.
    pub fn batches(&self) -> Result<Vec<BatchId>, RecordError> {
        if self.layout == Layout::Flat {
            return Ok(Vec::new());
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RecordError::io(&self.root, e)),
        };

        let mut batches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecordError::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(batch) = BatchId::parse(&name) {
                batches.push(batch);
            }
        }

        batches.sort_by(|a, b| b.cmp(a));
        Ok(batches)
    }

    /// Groups to scan for `scope`, newest first.
    pub fn groups(&self, scope: BatchScope) -> Result<Vec<RecordGroup>, RecordError> {
        if self.layout == Layout::Flat {
            return Ok(vec![RecordGroup {
                batch: None,
                newest: true,
            }]);
        }

        let mut groups: Vec<RecordGroup> = self
            .batches()?
            .into_iter()
            .enumerate()
            .map(|(index, batch)| RecordGroup {
                batch: Some(batch),
                newest: index == 0,
            })
            .collect();

        if scope == BatchScope::Newest {
            groups.truncate(1);
        }
        Ok(groups)
    }

    /// Move `record` into `destination`, keeping its batch.
    ///
    /// This is the commit point. It never overwrites an existing record and
    /// never falls back to copy + delete; any failure is returned as
    /// [`RecordError::MoveFailed`] and must not be retried automatically.
    pub fn move_record(
        &self,
        record: &SignatureRecord,
        destination: &RecordStore,
    ) -> Result<SignatureRecord, RecordError> {
        let batch = match destination.layout {
            Layout::Flat => None,
            Layout::Batched => record.batch().cloned(),
        };
        let to = destination.record_dir(record.image(), batch.as_ref())?;
        let from = record.path().to_path_buf();
        let move_failed = |source: io::Error| RecordError::MoveFailed {
            from: from.clone(),
            to: to.clone(),
            source,
        };

        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(move_failed)?;
        }
        if to.exists() {
            return Err(move_failed(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "destination record already exists",
            )));
        }

        fs::rename(&from, &to).map_err(move_failed)?;

        info!(
            image = %record.image(),
            from = %from.display(),
            to = %to.display(),
            stage = %destination.stage,
            "Record moved"
        );

        Ok(SignatureRecord::new(
            record.image().clone(),
            to,
            destination.stage,
            batch,
        ))
    }
}

/// Lazy iterator over the complete records of one directory.
pub struct Records {
    dir: PathBuf,
    entries: Option<fs::ReadDir>,
    stage: Stage,
    batch: Option<BatchId>,
}

impl Iterator for Records {
    type Item = Result<SignatureRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        for entry in entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(RecordError::io(&self.dir, e))),
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match SignatureRecord::load(&path, self.stage, self.batch.clone()) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {
                    debug!(path = %path.display(), "Skipping incomplete record");
                }
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BLOB_FILE, MANIFEST_FILE};
    use tempfile::TempDir;

    fn image(c: char) -> ImageReference {
        ImageReference::parse(&format!("ghcr.io/org/app@sha256:{}", c.to_string().repeat(64)))
            .unwrap()
    }

    fn complete(record: &SignatureRecord) {
        record.write_blob(b"blob").unwrap();
        record.commit_manifest(b"{}").unwrap();
    }

    #[test]
    fn create_writes_image_reference() {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::batched(tmp.path(), Stage::Prepared);
        let batch = BatchId::parse("20250101T000000Z").unwrap();

        let record = store.create(&image('a'), Some(&batch)).unwrap();
        let expected = tmp.path().join("20250101T000000Z").join("a".repeat(64));
        assert_eq!(record.path(), expected);
        assert_eq!(
            fs::read_to_string(expected.join(IMAGE_FILE)).unwrap(),
            image('a').to_string()
        );
    }

    #[test]
    fn create_is_idempotent_and_keeps_artifacts() {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::flat(tmp.path(), Stage::Prepared);

        let first = store.create(&image('a'), None).unwrap();
        complete(&first);
        let second = store.create(&image('a'), None).unwrap();

        assert_eq!(first.path(), second.path());
        assert_eq!(fs::read(second.blob_file()).unwrap(), b"blob");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn layout_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let batch = BatchId::parse("b1").unwrap();
        assert!(RecordStore::flat(tmp.path(), Stage::Prepared)
            .create(&image('a'), Some(&batch))
            .is_err());
        assert!(RecordStore::batched(tmp.path(), Stage::Prepared)
            .create(&image('a'), None)
            .is_err());
    }

    #[test]
    fn list_skips_files_and_partial_records() {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::flat(tmp.path(), Stage::Prepared);

        complete(&store.create(&image('a'), None).unwrap());
        store.create(&image('b'), None).unwrap();
        fs::write(tmp.path().join("README"), b"not a record").unwrap();

        let records: Vec<_> = store.list(None).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].digest(), "a".repeat(64));
    }

    #[test]
    fn list_of_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::flat(tmp.path().join("missing"), Stage::Prepared);
        assert_eq!(store.list(None).unwrap().count(), 0);
        assert!(RecordStore::batched(tmp.path().join("missing"), Stage::Prepared)
            .batches()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn batches_are_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::batched(tmp.path(), Stage::Prepared);
        for name in ["20240101T000000Z", "20250101T000000Z", "20240601T000000Z"] {
            fs::create_dir_all(tmp.path().join(name)).unwrap();
        }
        fs::write(tmp.path().join("20990101T000000Z"), b"a file").unwrap();

        let names: Vec<_> = store
            .batches()
            .unwrap()
            .into_iter()
            .map(|b| b.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["20250101T000000Z", "20240601T000000Z", "20240101T000000Z"]
        );

        let newest = store.groups(BatchScope::Newest).unwrap();
        assert_eq!(newest.len(), 1);
        assert!(newest[0].newest);

        let all = store.groups(BatchScope::All).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().skip(1).all(|g| !g.newest));
    }

    #[test]
    fn move_commits_record_into_destination() {
        let tmp = TempDir::new().unwrap();
        let source = RecordStore::batched(tmp.path().join("SIGNATURES"), Stage::Prepared);
        let published = RecordStore::batched(tmp.path().join("PUBLISHED"), Stage::Published);
        let batch = BatchId::parse("20250101T000000Z").unwrap();

        let record = source.create(&image('a'), Some(&batch)).unwrap();
        complete(&record);

        let moved = source.move_record(&record, &published).unwrap();
        assert_eq!(moved.stage(), Stage::Published);
        assert!(!record.path().exists());
        assert!(moved.path().join(MANIFEST_FILE).is_file());
        assert!(moved.path().join(BLOB_FILE).is_file());
        assert_eq!(source.list(Some(&batch)).unwrap().count(), 0);
        assert_eq!(published.list(Some(&batch)).unwrap().count(), 1);
    }

    #[test]
    fn move_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let source = RecordStore::flat(tmp.path().join("a"), Stage::Prepared);
        let published = RecordStore::flat(tmp.path().join("b"), Stage::Published);

        let record = source.create(&image('a'), None).unwrap();
        complete(&record);
        complete(&published.create(&image('a'), None).unwrap());

        let err = source.move_record(&record, &published).unwrap_err();
        assert!(err.is_move_failure());
        assert!(record.path().exists());
    }
}
