//! Storage roots on the filesystem.
//!
//! A [`StorageDirectory`] maps storage names to directories under the
//! configured root and owns every filesystem mutation the engines perform:
//! atomic file replacement, root moves on rename, root removal on clear, and
//! the root manifest.

use crate::config::BackendKind;
use crate::error::{Result, StorageError};
use crate::persistence::format::{StorageManifest, MANIFEST_FILE};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct StorageDirectory {
    root: PathBuf,
    separator: String,
}

impl StorageDirectory {
    pub fn new(root: impl Into<PathBuf>, separator: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            separator: separator.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `storage_name`.
    ///
    /// The base component may be any plain file name. Components after a
    /// separator are bundle tags: lowercase ASCII letters, digits and `_`,
    /// so they can never shadow the root's own files.
    pub fn path_for(&self, storage_name: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for (i, component) in storage_name.split(self.separator.as_str()).enumerate() {
            let valid = if i == 0 {
                is_plain_file_name(component)
            } else {
                is_tag(component)
            };
            if !valid {
                return Err(StorageError::InvalidConfiguration(format!(
                    "invalid storage name {storage_name:?}: bad component {component:?}"
                )));
            }
            path.push(component);
        }
        Ok(path)
    }

    /// Replace `path` with `data` so readers see either the old or the new
    /// contents, never a mix.
    pub fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::InvalidConfiguration(format!("{} has no parent", path.display()))
        })?;
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    /// Remove a storage root and everything under it. Missing roots are fine.
    pub fn remove_root(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Reject moving a root into itself or onto one of its ancestors.
    pub fn check_move(&self, from: &Path, to: &Path) -> Result<()> {
        if to.starts_with(from) || from.starts_with(to) {
            return Err(StorageError::InvalidConfiguration(format!(
                "cannot move {} to {}: one contains the other",
                from.display(),
                to.display()
            )));
        }
        Ok(())
    }

    /// Move a storage root. A missing source is a no-op.
    pub fn move_root(&self, from: &Path, to: &Path) -> Result<()> {
        if to.exists() {
            return Err(StorageError::NameConflict(to.display().to_string()));
        }
        if !from.exists() {
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }

    pub fn read_manifest(&self, root: &Path) -> Result<Option<StorageManifest>> {
        match fs::read(root.join(MANIFEST_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn write_manifest(&self, root: &Path, manifest: &StorageManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        self.atomic_write(&root.join(MANIFEST_FILE), &json)
    }

    /// Create the root and its manifest if missing; return the root.
    pub fn ensure_root(&self, storage_name: &str, backend: BackendKind) -> Result<PathBuf> {
        let root = self.path_for(storage_name)?;
        if self.read_manifest(&root)?.is_none() {
            fs::create_dir_all(&root)?;
            self.write_manifest(&root, &StorageManifest::new(storage_name, backend))?;
        }
        Ok(root)
    }

    /// Reject roots written by a different backend.
    pub fn check_backend(&self, storage_name: &str, backend: BackendKind) -> Result<()> {
        let root = self.path_for(storage_name)?;
        match self.read_manifest(&root)? {
            Some(manifest) if manifest.backend != backend => {
                Err(StorageError::InvalidConfiguration(format!(
                    "{storage_name} was written by the {} backend, not {}",
                    manifest.backend.as_str(),
                    backend.as_str()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Record a new owner name in a moved root's manifest.
    pub fn rename_manifest(&self, root: &Path, new_name: &str) -> Result<()> {
        if let Some(mut manifest) = self.read_manifest(root)? {
            manifest.storage_name = new_name.to_string();
            manifest.touch();
            self.write_manifest(root, &manifest)?;
        }
        Ok(())
    }
}

fn is_plain_file_name(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(&['/', '\\', '\0'][..])
}

fn is_tag(component: &str) -> bool {
    !component.is_empty()
        && component
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn nested_names_map_to_nested_dirs() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "/");
        let path = dir.path_for("MyModel/fs0").unwrap();
        assert_eq!(path, tmp.path().join("MyModel").join("fs0"));
    }

    #[test]
    fn custom_separator() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "::");
        let path = dir.path_for("model::ce").unwrap();
        assert_eq!(path, tmp.path().join("model").join("ce"));
        // '/' is not the separator here and is never allowed inside a component
        assert!(dir.path_for("a/b").is_err());
    }

    #[test]
    fn rejects_escaping_names() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "/");
        assert!(dir.path_for("").is_err());
        assert!(dir.path_for("..").is_err());
        assert!(dir.path_for("model/..").is_err());
        assert!(dir.path_for("model/PRIMARY_STORAGE").is_err());
        assert!(dir.path_for("model/").is_err());
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "/");
        let path = tmp.path().join("a").join("blob");
        dir.atomic_write(&path, b"first").unwrap();
        dir.atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp files left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn move_root_refuses_existing_target() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "/");
        let a = dir.ensure_root("a", BackendKind::Disk).unwrap();
        let b = dir.ensure_root("b", BackendKind::Disk).unwrap();
        assert!(matches!(
            dir.move_root(&a, &b),
            Err(StorageError::NameConflict(_))
        ));

        let c = dir.path_for("c").unwrap();
        dir.move_root(&a, &c).unwrap();
        assert!(!a.exists());
        assert!(c.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn nested_moves_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "/");
        let model = dir.path_for("model").unwrap();
        let member = dir.path_for("model/ns").unwrap();
        let sibling = dir.path_for("model2").unwrap();
        assert!(matches!(
            dir.check_move(&model, &member),
            Err(StorageError::InvalidConfiguration(_))
        ));
        assert!(dir.check_move(&member, &model).is_err());
        assert!(dir.check_move(&model, &sibling).is_ok());
    }

    #[test]
    fn backend_mismatch_is_detected() {
        let tmp = TempDir::new().unwrap();
        let dir = StorageDirectory::new(tmp.path(), "/");
        dir.ensure_root("m", BackendKind::InMemory).unwrap();
        assert!(dir.check_backend("m", BackendKind::InMemory).is_ok());
        assert!(matches!(
            dir.check_backend("m", BackendKind::Disk),
            Err(StorageError::InvalidConfiguration(_))
        ));
        // Fresh names are always acceptable
        assert!(dir.check_backend("fresh", BackendKind::Disk).is_ok());
    }
}
