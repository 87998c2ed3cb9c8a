//! Local-filesystem blob store.
//!
//! Keys are slash-separated paths under a base directory (e.g.
//! `snapshots/{workflow_id}/{snapshot_id}.json`). Writes go through a
//! temporary file and an atomic rename so a crashed write never leaves a
//! half-written blob under its final name.

use std::path::{Path, PathBuf};

use duramen_core::BlobStore;
use duramen_types::error::StorageError;

/// Filesystem-backed implementation of `BlobStore`.
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        // Keys are engine-generated, but refuse traversal outright.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(StorageError::Io(format!("invalid blob key '{key}'")));
        }
        Ok(self.base_dir.join(Path::new(key)))
    }
}

impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Io(format!("create {}: {e}", parent.display())))?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)
            .map_err(|e| StorageError::Io(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| StorageError::Io(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Io(format!("read {}: {e}", path.display()))),
        }
    }
}
