//! Big-map handles.
//!
//! A [`BigMap`] is a cheap, cloneable, `Send + Sync` handle to a named
//! collection owned by an engine. Every operation can fail: the map may live
//! on disk, and the engine that issued the handle may have been closed or
//! cleared since.

use crate::error::{Result, StorageError};
use crate::persistence::format::{MapKind, StorageType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bound for big-map keys.
pub trait MapKey:
    Serialize + DeserializeOwned + Clone + Eq + Hash + Ord + Send + Sync + 'static
{
}

impl<T> MapKey for T where
    T: Serialize + DeserializeOwned + Clone + Eq + Hash + Ord + Send + Sync + 'static
{
}

/// Bound for big-map values.
pub trait MapValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> MapValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Shared flag tying handles to the engine generation that issued them.
///
/// Closing or clearing an engine kills its token; every handle checks it.
#[derive(Debug, Clone)]
pub(crate) struct Liveness {
    alive: Arc<AtomicBool>,
    storage_name: Arc<str>,
}

impl Liveness {
    pub(crate) fn new(storage_name: &str) -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            storage_name: Arc::from(storage_name),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(StorageError::closed(&self.storage_name))
        }
    }

    /// Run a map operation; I/O failures poison the whole engine generation.
    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io_failure() {
                tracing::warn!(
                    storage = %self.storage_name,
                    error = %e,
                    "big map I/O failure; engine is no longer usable"
                );
                self.kill();
            }
        }
        result
    }
}

/// Storage behind a [`BigMap`] handle.
///
/// Callbacks passed to `for_each` must not touch the same map.
pub(crate) trait MapBackend<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;
    fn insert(&self, key: K, value: V) -> Result<Option<V>>;
    fn put(&self, key: K, value: V) -> Result<()>;
    fn remove(&self, key: &K) -> Result<Option<V>>;
    fn contains_key(&self, key: &K) -> Result<bool>;
    fn len(&self) -> Result<usize>;
    fn clear(&self) -> Result<()>;
    fn for_each(&self, f: &mut dyn FnMut(K, V) -> Result<()>) -> Result<()>;
    /// Detach from storage after the map has been dropped.
    fn invalidate(&self);
}

/// Typed handle to a named map.
///
/// `Default` yields an unbound handle, which is what model-parameter structs
/// hold before their knowledge base materializes them. Unbound handles fail
/// every operation with [`StorageError::InvalidState`].
pub struct BigMap<K, V> {
    name: String,
    kind: MapKind,
    storage_type: Option<StorageType>,
    backend: Option<Arc<dyn MapBackend<K, V>>>,
}

impl<K: MapKey, V: MapValue> BigMap<K, V> {
    pub(crate) fn bound(
        name: &str,
        kind: MapKind,
        storage_type: StorageType,
        backend: Arc<dyn MapBackend<K, V>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            storage_type: Some(storage_type),
            backend: Some(backend),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// Partition the map lives in; `None` when unbound.
    pub fn storage_type(&self) -> Option<StorageType> {
        self.storage_type
    }

    pub fn is_bound(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn MapBackend<K, V>>> {
        self.backend.as_ref().ok_or_else(|| {
            StorageError::InvalidState(format!(
                "big map {:?} is not bound to a storage engine",
                self.name
            ))
        })
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.backend()?.get(key)
    }

    /// Insert and return the previous value.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.backend()?.insert(key, value)
    }

    /// Insert without reading the previous value back.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.backend()?.put(key, value)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.backend()?.remove(key)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.backend()?.contains_key(key)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend()?.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.backend()?.clear()
    }

    /// Visit every entry. `TREEMAP`s are visited in ascending key order.
    ///
    /// The callback must not access this same map.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(K, V) -> Result<()>,
    {
        self.backend()?.for_each(&mut f)
    }

    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        self.for_each(|k, v| {
            out.push((k, v));
            Ok(())
        })?;
        Ok(out)
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        let mut out = Vec::new();
        self.for_each(|k, _| {
            out.push(k);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn extend<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let backend = self.backend()?;
        for (k, v) in entries {
            backend.put(k, v)?;
        }
        Ok(())
    }
}

impl<K, V> Default for BigMap<K, V> {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: MapKind::HashMap,
            storage_type: None,
            backend: None,
        }
    }
}

impl<K, V> Clone for BigMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            storage_type: self.storage_type,
            backend: self.backend.clone(),
        }
    }
}

impl<K, V> fmt::Debug for BigMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigMap")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("storage_type", &self.storage_type)
            .field("key_type", &type_name::<K>())
            .field("value_type", &type_name::<V>())
            .field("bound", &self.backend.is_some())
            .finish()
    }
}

/// Type-erased view of a handle, kept in engine catalogs.
pub(crate) trait MapHandle: Send + Sync {
    fn key_type(&self) -> &'static str;
    fn value_type(&self) -> &'static str;
    fn kind(&self) -> MapKind;
    fn invalidate(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<K: MapKey, V: MapValue> MapHandle for BigMap<K, V> {
    fn key_type(&self) -> &'static str {
        type_name::<K>()
    }

    fn value_type(&self) -> &'static str {
        type_name::<V>()
    }

    fn kind(&self) -> MapKind {
        self.kind
    }

    fn invalidate(&self) {
        if let Some(backend) = &self.backend {
            backend.invalidate();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An engine's record of one live map.
pub(crate) struct CatalogEntry {
    pub(crate) storage_type: StorageType,
    pub(crate) handle: Box<dyn MapHandle>,
}

impl CatalogEntry {
    pub(crate) fn new<K: MapKey, V: MapValue>(map: &BigMap<K, V>, storage_type: StorageType) -> Self {
        Self {
            storage_type,
            handle: Box::new(map.clone()),
        }
    }

    /// The cataloged handle, if it was created with the same types and kind.
    pub(crate) fn typed<K: MapKey, V: MapValue>(
        &self,
        name: &str,
        kind: MapKind,
    ) -> Result<BigMap<K, V>> {
        check_types::<K, V>(self.handle.key_type(), self.handle.value_type())?;
        check_kind(name, self.handle.kind(), kind)?;
        self.handle
            .as_any()
            .downcast_ref::<BigMap<K, V>>()
            .cloned()
            .ok_or_else(|| {
                StorageError::type_mismatch(type_name::<BigMap<K, V>>(), "another handle type")
            })
    }
}

pub(crate) fn check_types<K, V>(stored_key: &str, stored_value: &str) -> Result<()> {
    let (key, value) = (type_name::<K>(), type_name::<V>());
    if stored_key != key || stored_value != value {
        return Err(StorageError::type_mismatch(
            format!("({key}, {value})"),
            format!("({stored_key}, {stored_value})"),
        ));
    }
    Ok(())
}

pub(crate) fn check_kind(name: &str, stored: MapKind, requested: MapKind) -> Result<()> {
    if stored != requested {
        return Err(StorageError::InvalidConfiguration(format!(
            "big map {name:?} is a {}, not a {}",
            stored.as_str(),
            requested.as_str()
        )));
    }
    Ok(())
}
