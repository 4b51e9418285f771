//! The in-memory engine.
//!
//! Named objects stay resident in serialized form and every `save_object` is
//! also snapshotted to `<root>/OBJECTS/`, so a later process can load what
//! an earlier one saved. Big maps never touch disk and do not survive the
//! engine.

use crate::config::{BackendKind, StorageConfiguration};
use crate::error::{Result, StorageError};
use crate::persistence::big_map::{
    BigMap, CatalogEntry, Liveness, MapBackend, MapKey, MapValue,
};
use crate::persistence::blob_store::{BlobStore, FileBlobStore};
use crate::persistence::codec::{decode_object, encode_object};
use crate::persistence::directory::StorageDirectory;
use crate::persistence::engine::StorageEngine;
use crate::persistence::format::{MapKind, MapOptions, StorageType, OBJECTS_DIR};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Store<K, V> {
    Hash(RwLock<HashMap<K, V>>),
    Tree(RwLock<BTreeMap<K, V>>),
    Concurrent(DashMap<K, V>),
}

/// A resident big map.
pub(crate) struct MemoryMap<K, V> {
    name: String,
    store: Store<K, V>,
    liveness: Liveness,
    dropped: AtomicBool,
}

impl<K: MapKey, V: MapValue> MemoryMap<K, V> {
    pub(crate) fn new(name: &str, options: &MapOptions, liveness: Liveness) -> Self {
        let capacity = options.capacity.unwrap_or(0);
        let store = match (options.kind, options.concurrent) {
            (MapKind::HashMap, true) => Store::Concurrent(DashMap::with_capacity(capacity)),
            (MapKind::HashMap, false) => Store::Hash(RwLock::new(HashMap::with_capacity(capacity))),
            (MapKind::TreeMap, _) => Store::Tree(RwLock::new(BTreeMap::new())),
        };
        Self {
            name: name.to_string(),
            store,
            liveness,
            dropped: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        self.liveness.check()?;
        if self.dropped.load(Ordering::Acquire) {
            return Err(StorageError::InvalidState(format!(
                "big map {:?} has been dropped",
                self.name
            )));
        }
        Ok(())
    }
}

impl<K: MapKey, V: MapValue> MapBackend<K, V> for MemoryMap<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.check()?;
        Ok(match &self.store {
            Store::Hash(m) => m.read().get(key).cloned(),
            Store::Tree(m) => m.read().get(key).cloned(),
            Store::Concurrent(m) => m.get(key).map(|v| v.value().clone()),
        })
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.check()?;
        Ok(match &self.store {
            Store::Hash(m) => m.write().insert(key, value),
            Store::Tree(m) => m.write().insert(key, value),
            Store::Concurrent(m) => m.insert(key, value),
        })
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        self.insert(key, value).map(|_| ())
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        self.check()?;
        Ok(match &self.store {
            Store::Hash(m) => m.write().remove(key),
            Store::Tree(m) => m.write().remove(key),
            Store::Concurrent(m) => m.remove(key).map(|(_, v)| v),
        })
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        self.check()?;
        Ok(match &self.store {
            Store::Hash(m) => m.read().contains_key(key),
            Store::Tree(m) => m.read().contains_key(key),
            Store::Concurrent(m) => m.contains_key(key),
        })
    }

    fn len(&self) -> Result<usize> {
        self.check()?;
        Ok(match &self.store {
            Store::Hash(m) => m.read().len(),
            Store::Tree(m) => m.read().len(),
            Store::Concurrent(m) => m.len(),
        })
    }

    fn clear(&self) -> Result<()> {
        self.check()?;
        match &self.store {
            Store::Hash(m) => m.write().clear(),
            Store::Tree(m) => m.write().clear(),
            Store::Concurrent(m) => m.clear(),
        }
        Ok(())
    }

    fn for_each(&self, f: &mut dyn FnMut(K, V) -> Result<()>) -> Result<()> {
        self.check()?;
        // Read locks are held for the whole walk.
        match &self.store {
            Store::Hash(m) => {
                for (k, v) in m.read().iter() {
                    f(k.clone(), v.clone())?;
                }
            }
            Store::Tree(m) => {
                for (k, v) in m.read().iter() {
                    f(k.clone(), v.clone())?;
                }
            }
            Store::Concurrent(m) => {
                for entry in m.iter() {
                    f(entry.key().clone(), entry.value().clone())?;
                }
            }
        }
        Ok(())
    }

    fn invalidate(&self) {
        self.dropped.store(true, Ordering::Release);
        match &self.store {
            Store::Hash(m) => m.write().clear(),
            Store::Tree(m) => m.write().clear(),
            Store::Concurrent(m) => m.clear(),
        }
    }
}

struct MemoryState {
    storage_name: String,
    root: PathBuf,
    objects: HashMap<String, Vec<u8>>,
    catalog: HashMap<String, CatalogEntry>,
    liveness: Liveness,
    closed: bool,
}

impl MemoryState {
    fn check_open(&self) -> Result<()> {
        if self.closed || !self.liveness.is_alive() {
            return Err(StorageError::closed(&self.storage_name));
        }
        Ok(())
    }

    fn blobs(&self) -> FileBlobStore {
        FileBlobStore::new(self.root.join(OBJECTS_DIR))
    }

    /// Close the engine if `result` is an I/O failure.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io_failure() {
                warn!(storage = %self.storage_name, error = %e, "I/O failure; closing engine");
                self.shutdown();
            }
        }
        result
    }

    fn invalidate_maps(&mut self) {
        for (_, entry) in self.catalog.drain() {
            entry.handle.invalidate();
        }
    }

    fn shutdown(&mut self) {
        self.liveness.kill();
        self.invalidate_maps();
        self.objects.clear();
        self.closed = true;
    }
}

/// Engine keeping everything resident, with object snapshots on disk.
pub struct InMemoryEngine {
    config: StorageConfiguration,
    dir: StorageDirectory,
    state: Mutex<MemoryState>,
}

impl InMemoryEngine {
    pub fn open(storage_name: &str, config: &StorageConfiguration) -> Result<Self> {
        let dir = StorageDirectory::new(&config.root_directory, &config.separator);
        let root = dir.path_for(storage_name)?;
        dir.check_backend(storage_name, BackendKind::InMemory)?;
        if config.compressed || config.asynchronous {
            debug!(storage = storage_name, "compressed/asynchronous options are reserved and ignored");
        }
        info!(storage = storage_name, root = %root.display(), "opened in-memory engine");
        Ok(Self {
            config: config.clone(),
            dir,
            state: Mutex::new(MemoryState {
                storage_name: storage_name.to_string(),
                root,
                objects: HashMap::new(),
                catalog: HashMap::new(),
                liveness: Liveness::new(storage_name),
                closed: false,
            }),
        })
    }

    pub fn config(&self) -> &StorageConfiguration {
        &self.config
    }

    /// Storage root of the current name.
    pub fn root(&self) -> PathBuf {
        self.state.lock().root.clone()
    }

    fn write_snapshot(&self, root: &Path, storage_name: &str, name: &str, bytes: &[u8]) -> Result<()> {
        self.dir.ensure_root(storage_name, BackendKind::InMemory)?;
        FileBlobStore::new(root.join(OBJECTS_DIR)).put(name, bytes)
    }
}

impl StorageEngine for InMemoryEngine {
    fn storage_name(&self) -> String {
        self.state.lock().storage_name.clone()
    }

    fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || !state.liveness.is_alive()
    }

    fn exists_object(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.objects.contains_key(name) {
            return Ok(true);
        }
        let found = state.blobs().exists(name);
        state.guard(found)
    }

    fn save_object<T: Serialize + 'static>(&self, name: &str, value: &T) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let bytes = encode_object(value)?;
        let written = self.write_snapshot(&state.root, &state.storage_name, name, &bytes);
        state.guard(written)?;
        state.objects.insert(name.to_string(), bytes);
        debug!(storage = %state.storage_name, object = name, "saved object");
        Ok(())
    }

    fn load_object<T: DeserializeOwned + 'static>(&self, name: &str) -> Result<T> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(bytes) = state.objects.get(name) {
            return decode_object(bytes);
        }
        let read = state.blobs().get(name);
        match state.guard(read)? {
            Some(bytes) => {
                let value = decode_object(&bytes)?;
                state.objects.insert(name.to_string(), bytes);
                Ok(value)
            }
            None => Err(StorageError::NotFound(format!(
                "object {name:?} in {}",
                state.storage_name
            ))),
        }
    }

    fn drop_object(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.objects.remove(name);
        let deleted = state.blobs().delete(name);
        state.guard(deleted)
    }

    fn get_big_map<K: MapKey, V: MapValue>(
        &self,
        name: &str,
        options: MapOptions,
    ) -> Result<BigMap<K, V>> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(entry) = state.catalog.get(name) {
            return entry.typed(name, options.kind);
        }

        let storage_type = options.storage_type();
        let backend: Arc<dyn MapBackend<K, V>> =
            Arc::new(MemoryMap::<K, V>::new(name, &options, state.liveness.clone()));
        let map = BigMap::bound(name, options.kind, storage_type, backend);
        state
            .catalog
            .insert(name.to_string(), CatalogEntry::new(&map, storage_type));
        debug!(
            storage = %state.storage_name,
            map = name,
            kind = options.kind.as_str(),
            ?storage_type,
            "created big map"
        );
        Ok(map)
    }

    fn drop_big_map(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(entry) = state.catalog.remove(name) {
            entry.handle.invalidate();
            debug!(storage = %state.storage_name, map = name, "dropped big map");
        }
        Ok(())
    }

    fn storage_type_of(&self, name: &str) -> Result<Option<StorageType>> {
        let state = self.state.lock();
        state.check_open()?;
        Ok(state.catalog.get(name).map(|entry| entry.storage_type))
    }

    fn big_map_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.catalog.keys().cloned().collect();
        names.sort();
        names
    }

    fn rename(&mut self, new_name: &str) -> Result<bool> {
        let dir = self.dir.clone();
        let state = self.state.get_mut();
        state.check_open()?;
        if state.storage_name == new_name {
            return Ok(false);
        }
        let new_root = dir.path_for(new_name)?;
        dir.check_move(&state.root, &new_root)?;
        if new_root.exists() {
            return Err(StorageError::NameConflict(new_name.to_string()));
        }
        let moved = dir
            .move_root(&state.root, &new_root)
            .and_then(|()| dir.rename_manifest(&new_root, new_name));
        state.guard(moved)?;
        info!(from = %state.storage_name, to = new_name, "renamed in-memory engine");
        state.storage_name = new_name.to_string();
        state.root = new_root;
        Ok(true)
    }

    fn clear(&mut self) -> Result<()> {
        let dir = self.dir.clone();
        let state = self.state.get_mut();
        state.check_open()?;
        state.liveness.kill();
        state.invalidate_maps();
        state.objects.clear();
        state.liveness = Liveness::new(&state.storage_name);
        let removed = dir.remove_root(&state.root);
        state.guard(removed)?;
        info!(storage = %state.storage_name, "cleared in-memory engine");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        if state.closed {
            return Ok(());
        }
        state.shutdown();
        info!(storage = %state.storage_name, "closed in-memory engine");
        Ok(())
    }
}

impl Drop for InMemoryEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryEngine")
            .field("storage_name", &state.storage_name)
            .field("root", &state.root)
            .field("objects", &state.objects.len())
            .field("big_maps", &state.catalog.len())
            .field("closed", &state.closed)
            .finish()
    }
}
