//! The storage-engine contract and the backend enum.

use crate::config::{BackendKind, StorageConfiguration};
use crate::error::Result;
use crate::persistence::big_map::{BigMap, MapKey, MapValue};
use crate::persistence::disk::DiskEngine;
use crate::persistence::format::{MapOptions, StorageType};
use crate::persistence::memory::InMemoryEngine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

/// Operations every backend provides for one storage name.
///
/// Every operation on a closed engine fails with
/// [`StorageError::AlreadyClosed`](crate::StorageError::AlreadyClosed),
/// except `close` itself, which is idempotent. An I/O failure closes the
/// engine; recovery means opening a new one.
pub trait StorageEngine {
    fn storage_name(&self) -> String;

    fn is_closed(&self) -> bool;

    fn exists_object(&self, name: &str) -> Result<bool>;

    /// Serialize `value` under `name`, replacing any previous value.
    fn save_object<T: Serialize + 'static>(&self, name: &str, value: &T) -> Result<()>;

    /// `NotFound` if absent, `TypeMismatch` if stored as another type.
    fn load_object<T: DeserializeOwned + 'static>(&self, name: &str) -> Result<T>;

    /// Remove a named object. Missing objects are not an error.
    fn drop_object(&self, name: &str) -> Result<()>;

    /// Obtain the big map called `name`, creating it if it does not exist.
    ///
    /// When the name already exists, the existing collection is reused and
    /// `options.hint`/`options.temporary` are ignored. A different key or
    /// value type is a `TypeMismatch`; a different kind is an
    /// `InvalidConfiguration`.
    fn get_big_map<K: MapKey, V: MapValue>(
        &self,
        name: &str,
        options: MapOptions,
    ) -> Result<BigMap<K, V>>;

    /// Delete a big map's contents and representation. Handles to it stop
    /// working. Dropping a missing map is not an error.
    fn drop_big_map(&self, name: &str) -> Result<()>;

    /// Partition holding `name`, if the map exists.
    fn storage_type_of(&self, name: &str) -> Result<Option<StorageType>>;

    /// Big maps acquired through this engine since it was opened or cleared.
    fn big_map_names(&self) -> Vec<String>;

    /// Move the storage root to `new_name`. Returns `false` when unchanged.
    ///
    /// Names nested under this one (`"<name>/<tag>"`, as used by bundle
    /// members) live inside its root and move with it, becoming
    /// `"<new_name>/<tag>"`. Moving a root into itself or onto an ancestor
    /// is an `InvalidConfiguration` and leaves the engine open.
    fn rename(&mut self, new_name: &str) -> Result<bool>;

    /// Delete everything stored under this name. The engine stays open.
    ///
    /// Nested names (`"<name>/<tag>"`) live inside this root and are deleted
    /// too.
    fn clear(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Backend selected once from a [`StorageConfiguration`].
#[derive(Debug)]
pub enum Engine {
    InMemory(InMemoryEngine),
    Disk(DiskEngine),
}

macro_rules! delegate {
    ($self:ident, $engine:ident => $body:expr) => {
        match $self {
            Engine::InMemory($engine) => $body,
            Engine::Disk($engine) => $body,
        }
    };
}

impl Engine {
    pub fn open(storage_name: &str, config: &StorageConfiguration) -> Result<Self> {
        match config.backend {
            BackendKind::InMemory => InMemoryEngine::open(storage_name, config).map(Engine::InMemory),
            BackendKind::Disk => DiskEngine::open(storage_name, config).map(Engine::Disk),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Engine::InMemory(_) => BackendKind::InMemory,
            Engine::Disk(_) => BackendKind::Disk,
        }
    }

    pub fn config(&self) -> &StorageConfiguration {
        delegate!(self, e => e.config())
    }

    /// Directory of the temporary partitions, while any are open.
    pub fn temporary_directory(&self) -> Option<PathBuf> {
        match self {
            Engine::InMemory(_) => None,
            Engine::Disk(e) => e.temporary_directory(),
        }
    }
}

impl StorageEngine for Engine {
    fn storage_name(&self) -> String {
        delegate!(self, e => e.storage_name())
    }

    fn is_closed(&self) -> bool {
        delegate!(self, e => e.is_closed())
    }

    fn exists_object(&self, name: &str) -> Result<bool> {
        delegate!(self, e => e.exists_object(name))
    }

    fn save_object<T: Serialize + 'static>(&self, name: &str, value: &T) -> Result<()> {
        delegate!(self, e => e.save_object(name, value))
    }

    fn load_object<T: DeserializeOwned + 'static>(&self, name: &str) -> Result<T> {
        delegate!(self, e => e.load_object(name))
    }

    fn drop_object(&self, name: &str) -> Result<()> {
        delegate!(self, e => e.drop_object(name))
    }

    fn get_big_map<K: MapKey, V: MapValue>(
        &self,
        name: &str,
        options: MapOptions,
    ) -> Result<BigMap<K, V>> {
        delegate!(self, e => e.get_big_map(name, options))
    }

    fn drop_big_map(&self, name: &str) -> Result<()> {
        delegate!(self, e => e.drop_big_map(name))
    }

    fn storage_type_of(&self, name: &str) -> Result<Option<StorageType>> {
        delegate!(self, e => e.storage_type_of(name))
    }

    fn big_map_names(&self) -> Vec<String> {
        delegate!(self, e => e.big_map_names())
    }

    fn rename(&mut self, new_name: &str) -> Result<bool> {
        delegate!(self, e => e.rename(new_name))
    }

    fn clear(&mut self) -> Result<()> {
        delegate!(self, e => e.clear())
    }

    fn close(&mut self) -> Result<()> {
        delegate!(self, e => e.close())
    }
}
