//! Blob storage for named-object snapshots.
//!
//! The in-memory engine keeps objects resident but snapshots every
//! `save_object` here so a later process can load it.

use crate::error::{Result, StorageError};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Byte snapshots addressed by object name.
pub trait BlobStore: Send + Sync {
    /// Store a blob, replacing any previous blob under `key` atomically.
    fn put(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// `Ok(None)` if the key has no blob.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a blob. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// File-based blob storage.
///
/// One file per key, named by the hex encoding of the key so that object
/// names may contain any character.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    base_path: PathBuf,
}

impl FileBlobStore {
    /// The directory is created lazily on first `put`.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.obj", hex::encode(key.as_bytes())))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.base_path)?;

        // Write to a temp file in the same directory, then rename over the target
        let mut tmp = NamedTempFile::new_in(&self.base_path)?;
        tmp.write_all(blob)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.key_to_path(key))
            .map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.key_to_path(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_to_path(key).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn snapshots_replace_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FileBlobStore::new(tmp.path().join("OBJECTS"));
        assert!(!store.exists("modelParameters").unwrap());
        assert!(store.get("modelParameters").unwrap().is_none());
        // Directory appears only once something is written
        assert!(!tmp.path().join("OBJECTS").exists());

        store.put("modelParameters", b"first").unwrap();
        store.put("modelParameters", b"second").unwrap();
        assert_eq!(store.get("modelParameters").unwrap().as_deref(), Some(&b"second"[..]));

        store.delete("modelParameters").unwrap();
        store.delete("modelParameters").unwrap();
        assert!(!store.exists("modelParameters").unwrap());
    }

    #[test]
    fn object_names_never_escape_the_directory() {
        let tmp = TempDir::new().unwrap();
        let store = FileBlobStore::new(tmp.path());
        for name in ["a/b/../c", "..", "with space", "ünïcode"] {
            store.put(name, name.as_bytes()).unwrap();
            assert_eq!(store.key_to_path(name).parent(), Some(tmp.path()));
            assert_eq!(store.get(name).unwrap().as_deref(), Some(name.as_bytes()));
        }
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 4);
    }
}
