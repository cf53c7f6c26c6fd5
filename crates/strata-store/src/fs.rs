//! Filesystem object backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/blob/ab/abcdef...   file content blobs
//! objects/layer/12/1234...    serialized layer records
//! tmp/                        staging area for atomic writes
//! ```
//!
//! Writes go to a temp file in `tmp/` and are renamed into place, so a crash
//! never leaves a partially written object under its final name.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use strata_types::Digest;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::ObjectBackend;
use crate::error::StoreResult;
use crate::object::{ObjectKind, StoredObject};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// One file per object under a root directory.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    /// `fsync` every object before renaming it into place.
    sync_writes: bool,
}

impl FsBackend {
    /// Open (or create) a backend rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for kind in ObjectKind::ALL {
            fs::create_dir_all(root.join(OBJECTS_DIR).join(kind.dir_name()))?;
        }
        fs::create_dir_all(root.join(TMP_DIR))?;
        debug!(root = %root.display(), "opened filesystem object backend");
        Ok(Self {
            root,
            sync_writes: true,
        })
    }

    /// Skip `fsync` on writes. Faster, but a power loss may lose objects.
    pub fn without_sync(mut self) -> Self {
        self.sync_writes = false;
        self
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, kind: ObjectKind, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join(OBJECTS_DIR)
            .join(kind.dir_name())
            .join(&hex[..2])
            .join(hex)
    }

    /// Locate an object on disk, probing each kind directory.
    fn locate(&self, digest: &Digest) -> Option<(ObjectKind, PathBuf)> {
        ObjectKind::ALL
            .into_iter()
            .map(|kind| (kind, self.object_path(kind, digest)))
            .find(|(_, path)| path.is_file())
    }
}

impl ObjectBackend for FsBackend {
    fn read(&self, digest: &Digest) -> StoreResult<Option<StoredObject>> {
        let Some((kind, path)) = self.locate(digest) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(data) => Ok(Some(StoredObject::new(kind, data))),
            // Deleted between locate and read.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, digest: &Digest, object: &StoredObject) -> StoreResult<()> {
        let path = self.object_path(object.kind, digest);
        if path.is_file() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        tmp.write_all(&object.data)?;
        if self.sync_writes {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(self.locate(digest).is_some())
    }

    fn delete(&self, digest: &Digest) -> StoreResult<bool> {
        let Some((_, path)) = self.locate(digest) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> StoreResult<Vec<(Digest, ObjectKind, u64)>> {
        let mut all = Vec::new();
        for kind in ObjectKind::ALL {
            let dir = self.root.join(OBJECTS_DIR).join(kind.dir_name());
            for entry in WalkDir::new(&dir).min_depth(2).max_depth(2) {
                let entry = entry.map_err(io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                match Digest::from_hex(&name) {
                    Ok(digest) => {
                        let size = entry.metadata().map_err(io::Error::from)?.len();
                        all.push((digest, kind, size));
                    }
                    Err(_) => {
                        warn!(path = %entry.path().display(), "skipping stray file in object directory");
                    }
                }
            }
        }
        all.sort_by_key(|(digest, _, _)| *digest);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(backend: &FsBackend, kind: ObjectKind, content: &[u8]) -> Digest {
        let obj = StoredObject::new(kind, content.to_vec());
        let digest = obj.compute_digest();
        backend.write(&digest, &obj).unwrap();
        digest
    }

    #[test]
    fn write_read_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();

        let digest = put(&backend, ObjectKind::Blob, b"on disk");
        let obj = backend.read(&digest).unwrap().expect("should exist");
        assert_eq!(obj.kind, ObjectKind::Blob);
        assert_eq!(obj.data, b"on disk");

        assert!(backend.delete(&digest).unwrap());
        assert!(!backend.exists(&digest).unwrap());
        assert!(backend.read(&digest).unwrap().is_none());
    }

    #[test]
    fn objects_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let digest = {
            let backend = FsBackend::open(dir.path()).unwrap().without_sync();
            put(&backend, ObjectKind::Layer, b"{\"parent\":null}")
        };

        let reopened = FsBackend::open(dir.path()).unwrap();
        let obj = reopened.read(&digest).unwrap().expect("persisted");
        assert_eq!(obj.kind, ObjectKind::Layer);
        assert_eq!(obj.compute_digest(), digest);
    }

    #[test]
    fn list_reports_kind_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        let blob = put(&backend, ObjectKind::Blob, b"12345");
        let layer = put(&backend, ObjectKind::Layer, b"{}");

        let all = backend.list().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&(blob, ObjectKind::Blob, 5)));
        assert!(all.contains(&(layer, ObjectKind::Layer, 2)));
    }

    #[test]
    fn stray_files_are_ignored_by_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        let stray = dir.path().join("objects/blob/zz");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("not-a-digest"), b"junk").unwrap();
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn rewrite_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        let d1 = put(&backend, ObjectKind::Blob, b"same");
        let d2 = put(&backend, ObjectKind::Blob, b"same");
        assert_eq!(d1, d2);
        assert_eq!(backend.list().unwrap().len(), 1);
    }
}
