//! The disk-backed engine.
//!
//! Up to four partitions are open at a time, one per [`StorageType`]. The
//! permanent ones live in the storage root and are opened lazily: reads
//! never create files, the first write creates the root. Temporary ones
//! live in a process temp directory that is deleted on close.
//!
//! Named objects are rows in the primary partition. Each big map is a table
//! in the partition chosen when the map was first created; later requests
//! for the same name find it by probing partitions in
//! [`StorageType::PRIORITY`] order.

mod map;
mod partition;

use crate::config::{BackendKind, StorageConfiguration};
use crate::error::{Result, StorageError};
use crate::persistence::big_map::{
    check_kind, check_types, BigMap, CatalogEntry, Liveness, MapBackend, MapKey, MapValue,
};
use crate::persistence::codec::{decode_object, encode_object};
use crate::persistence::directory::StorageDirectory;
use crate::persistence::engine::StorageEngine;
use crate::persistence::format::{MapOptions, StorageType};
use map::DiskMap;
use parking_lot::Mutex;
use partition::Partition;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

struct DiskState {
    storage_name: String,
    root: PathBuf,
    partitions: HashMap<StorageType, Arc<Partition>>,
    temp_dir: Option<TempDir>,
    /// Name -> partition, filled on the first successful probe.
    resolved: HashMap<String, StorageType>,
    catalog: HashMap<String, CatalogEntry>,
    liveness: Liveness,
    closed: bool,
}

impl DiskState {
    fn check_open(&self) -> Result<()> {
        if self.closed || !self.liveness.is_alive() {
            return Err(StorageError::closed(&self.storage_name));
        }
        Ok(())
    }

    /// Close the engine if `result` is an I/O failure.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io_failure() {
                warn!(storage = %self.storage_name, error = %e, "I/O failure; closing engine");
                // Already failing; the original error is the one to report.
                let _ = self.shutdown();
            }
        }
        result
    }

    fn invalidate_maps(&mut self, keep: impl Fn(StorageType) -> bool) {
        self.catalog.retain(|_, entry| {
            let kept = keep(entry.storage_type);
            if !kept {
                entry.handle.invalidate();
            }
            kept
        });
        self.resolved.retain(|_, storage_type| keep(*storage_type));
    }

    /// Close partitions matching `which`; the first error wins.
    fn close_partitions(&mut self, which: impl Fn(StorageType) -> bool) -> Result<()> {
        let mut first_error = None;
        let types: Vec<StorageType> = self
            .partitions
            .keys()
            .copied()
            .filter(|t| which(*t))
            .collect();
        for storage_type in types {
            if let Some(partition) = self.partitions.remove(&storage_type) {
                if let Err(e) = partition.close() {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.liveness.kill();
        self.invalidate_maps(|_| false);
        let closed = self.close_partitions(|_| true);
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove temporary partitions");
            }
        }
        self.closed = true;
        closed
    }
}

/// Engine keeping big maps in paged partition files.
pub struct DiskEngine {
    config: StorageConfiguration,
    dir: StorageDirectory,
    state: Mutex<DiskState>,
}

impl DiskEngine {
    pub fn open(storage_name: &str, config: &StorageConfiguration) -> Result<Self> {
        let dir = StorageDirectory::new(&config.root_directory, &config.separator);
        let root = dir.path_for(storage_name)?;
        dir.check_backend(storage_name, BackendKind::Disk)?;
        if config.compressed || config.asynchronous {
            debug!(storage = storage_name, "compressed/asynchronous options are reserved and ignored");
        }
        info!(
            storage = storage_name,
            root = %root.display(),
            cache_size = config.cache_size,
            "opened disk engine"
        );
        Ok(Self {
            config: config.clone(),
            dir,
            state: Mutex::new(DiskState {
                storage_name: storage_name.to_string(),
                root,
                partitions: HashMap::new(),
                temp_dir: None,
                resolved: HashMap::new(),
                catalog: HashMap::new(),
                liveness: Liveness::new(storage_name),
                closed: false,
            }),
        })
    }

    pub fn config(&self) -> &StorageConfiguration {
        &self.config
    }

    pub fn root(&self) -> PathBuf {
        self.state.lock().root.clone()
    }

    /// Directory holding the temporary partitions, once one has been opened.
    pub fn temporary_directory(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .temp_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    /// The open partition for `storage_type`, opening it if its file exists
    /// or `create` is set. Returns `None` when there is nothing to open.
    fn partition(
        &self,
        state: &mut DiskState,
        storage_type: StorageType,
        create: bool,
    ) -> Result<Option<Arc<Partition>>> {
        if let Some(p) = state.partitions.get(&storage_type) {
            return Ok(Some(Arc::clone(p)));
        }
        let path = if storage_type.is_temporary() {
            // Temporary partitions exist only while open.
            if !create {
                return Ok(None);
            }
            if state.temp_dir.is_none() {
                let dir = tempfile::Builder::new()
                    .prefix("knowledge-store-")
                    .tempdir()?;
                debug!(storage = %state.storage_name, path = %dir.path().display(), "created temporary partition directory");
                state.temp_dir = Some(dir);
            }
            match &state.temp_dir {
                Some(dir) => dir.path().join(storage_type.file_name()),
                None => return Ok(None),
            }
        } else {
            let path = state.root.join(storage_type.file_name());
            if !path.exists() {
                if !create {
                    return Ok(None);
                }
                self.dir.ensure_root(&state.storage_name, BackendKind::Disk)?;
            }
            path
        };
        let partition = Arc::new(Partition::open(&path, storage_type)?);
        state.partitions.insert(storage_type, Arc::clone(&partition));
        Ok(Some(partition))
    }

    /// Find the partition that already holds `name`.
    fn resolve(&self, state: &mut DiskState, name: &str) -> Result<Option<Arc<Partition>>> {
        if let Some(storage_type) = state.resolved.get(name).copied() {
            if let Some(p) = self.partition(state, storage_type, false)? {
                return Ok(Some(p));
            }
            state.resolved.remove(name);
        }
        for storage_type in StorageType::PRIORITY {
            let Some(partition) = self.partition(state, storage_type, false)? else {
                continue;
            };
            if partition.has_map(name)? {
                state.resolved.insert(name.to_string(), storage_type);
                return Ok(Some(partition));
            }
        }
        Ok(None)
    }

    fn open_map<K: MapKey, V: MapValue>(
        &self,
        state: &mut DiskState,
        name: &str,
        options: &MapOptions,
    ) -> Result<BigMap<K, V>> {
        let (partition, record) = match self.resolve(state, name)? {
            Some(partition) => {
                let record = partition.map_record(name)?.ok_or_else(|| {
                    StorageError::NotFound(format!("big map {name:?} vanished from its partition"))
                })?;
                check_types::<K, V>(&record.key_type, &record.value_type)?;
                check_kind(name, record.kind, options.kind)?;
                debug!(storage = %state.storage_name, map = name, partition = ?partition.storage_type(), "reopened big map");
                (partition, record)
            }
            None => {
                let storage_type = options.storage_type();
                let partition = self.partition(state, storage_type, true)?.ok_or_else(|| {
                    StorageError::InvalidState(format!("no partition for {storage_type:?}"))
                })?;
                let record = partition.create_map(
                    name,
                    options.kind,
                    type_name::<K>(),
                    type_name::<V>(),
                    options.concurrent,
                )?;
                state.resolved.insert(name.to_string(), storage_type);
                debug!(
                    storage = %state.storage_name,
                    map = name,
                    kind = options.kind.as_str(),
                    ?storage_type,
                    "created big map"
                );
                (partition, record)
            }
        };
        let storage_type = partition.storage_type();
        let backend: Arc<dyn MapBackend<K, V>> = Arc::new(DiskMap::<K, V>::new(
            name,
            &record.table,
            record.kind,
            partition,
            self.config.cache_size,
            state.liveness.clone(),
        ));
        Ok(BigMap::bound(name, record.kind, storage_type, backend))
    }
}

impl StorageEngine for DiskEngine {
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
        let found = self
            .partition(&mut state, StorageType::Primary, false)
            .and_then(|p| match p {
                Some(p) => p.object_exists(name),
                None => Ok(false),
            });
        state.guard(found)
    }

    fn save_object<T: Serialize + 'static>(&self, name: &str, value: &T) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let bytes = encode_object(value)?;
        let written = self
            .partition(&mut state, StorageType::Primary, true)
            .and_then(|p| match p {
                Some(p) => p.put_object(name, &bytes),
                None => Err(StorageError::InvalidState("primary partition unavailable".into())),
            });
        state.guard(written)?;
        debug!(storage = %state.storage_name, object = name, bytes = bytes.len(), "saved object");
        Ok(())
    }

    fn load_object<T: DeserializeOwned + 'static>(&self, name: &str) -> Result<T> {
        let mut state = self.state.lock();
        state.check_open()?;
        let read = self
            .partition(&mut state, StorageType::Primary, false)
            .and_then(|p| match p {
                Some(p) => p.get_object(name),
                None => Ok(None),
            });
        match state.guard(read)? {
            Some(bytes) => decode_object(&bytes),
            None => Err(StorageError::NotFound(format!(
                "object {name:?} in {}",
                state.storage_name
            ))),
        }
    }

    fn drop_object(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let deleted = self
            .partition(&mut state, StorageType::Primary, false)
            .and_then(|p| match p {
                Some(p) => p.delete_object(name),
                None => Ok(()),
            });
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
        let opened = self.open_map::<K, V>(&mut state, name, &options);
        let map = state.guard(opened)?;
        let storage_type = map.storage_type().unwrap_or_else(|| options.storage_type());
        state
            .catalog
            .insert(name.to_string(), CatalogEntry::new(&map, storage_type));
        Ok(map)
    }

    fn drop_big_map(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(entry) = state.catalog.remove(name) {
            entry.handle.invalidate();
        }
        let dropped = self
            .resolve(&mut state, name)
            .and_then(|p| match p {
                Some(p) => p.drop_map(name),
                None => Ok(false),
            });
        if state.guard(dropped)? {
            debug!(storage = %state.storage_name, map = name, "dropped big map");
        }
        state.resolved.remove(name);
        Ok(())
    }

    fn storage_type_of(&self, name: &str) -> Result<Option<StorageType>> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(entry) = state.catalog.get(name) {
            return Ok(Some(entry.storage_type));
        }
        let resolved = self.resolve(&mut state, name);
        state
            .guard(resolved)
            .map(|p| p.map(|p| p.storage_type()))
    }

    fn big_map_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.catalog.keys().cloned().collect();
        names.sort();
        names
    }

    fn rename(&mut self, new_name: &str) -> Result<bool> {
        let state = self.state.get_mut();
        state.check_open()?;
        if state.storage_name == new_name {
            return Ok(false);
        }
        let new_root = self.dir.path_for(new_name)?;
        self.dir.check_move(&state.root, &new_root)?;
        if new_root.exists() {
            return Err(StorageError::NameConflict(new_name.to_string()));
        }

        // Permanent partitions live in the root; quiesce them before moving it.
        state.invalidate_maps(|t| t.is_temporary());
        let closed = state.close_partitions(|t| !t.is_temporary());
        state.guard(closed)?;
        let moved = self
            .dir
            .move_root(&state.root, &new_root)
            .and_then(|()| self.dir.rename_manifest(&new_root, new_name));
        state.guard(moved)?;

        info!(from = %state.storage_name, to = new_name, "renamed disk engine");
        state.storage_name = new_name.to_string();
        state.root = new_root;
        Ok(true)
    }

    fn clear(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        state.check_open()?;
        state.liveness.kill();
        state.invalidate_maps(|_| false);
        let closed = state.close_partitions(|_| true);
        state.guard(closed)?;
        if let Some(dir) = state.temp_dir.take() {
            let removed = dir.close().map_err(StorageError::Io);
            state.guard(removed)?;
        }
        let removed = self.dir.remove_root(&state.root);
        state.guard(removed)?;
        state.liveness = Liveness::new(&state.storage_name);
        info!(storage = %state.storage_name, "cleared disk engine");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        if state.closed {
            return Ok(());
        }
        let result = state.shutdown();
        info!(storage = %state.storage_name, "closed disk engine");
        result
    }
}

impl Drop for DiskEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for DiskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let mut partitions: Vec<StorageType> = state.partitions.keys().copied().collect();
        partitions.sort();
        f.debug_struct("DiskEngine")
            .field("storage_name", &state.storage_name)
            .field("root", &state.root)
            .field("partitions", &partitions)
            .field("big_maps", &state.catalog.len())
            .field("closed", &state.closed)
            .finish()
    }
}
