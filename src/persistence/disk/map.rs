//! Big maps backed by a partition table.

use crate::error::{Result, StorageError};
use crate::persistence::big_map::{Liveness, MapBackend, MapKey, MapValue};
use crate::persistence::disk::partition::Partition;
use crate::persistence::encoding::{encoder_for, key_encoder_for, Encoder};
use crate::persistence::format::MapKind;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rows fetched per lock acquisition while iterating.
const PAGE_SIZE: i64 = 1024;

pub(crate) struct DiskMap<K, V> {
    name: String,
    table: String,
    kind: MapKind,
    partition: Arc<Partition>,
    keys: Arc<dyn Encoder<K>>,
    values: Arc<dyn Encoder<V>>,
    /// Write-through; only for cache-eligible partitions.
    cache: Option<Mutex<LruCache<K, V>>>,
    liveness: Liveness,
    dropped: AtomicBool,
}

impl<K: MapKey, V: MapValue> DiskMap<K, V> {
    pub(crate) fn new(
        name: &str,
        table: &str,
        kind: MapKind,
        partition: Arc<Partition>,
        cache_size: usize,
        liveness: Liveness,
    ) -> Self {
        let cache = if partition.storage_type().is_cache_eligible() {
            NonZeroUsize::new(cache_size).map(|cap| Mutex::new(LruCache::new(cap)))
        } else {
            None
        };
        Self {
            name: name.to_string(),
            table: table.to_string(),
            kind,
            partition,
            keys: key_encoder_for::<K>(),
            values: encoder_for::<V>(),
            cache,
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

    /// Run `op` with the cache locked, so a row and its cached copy change
    /// together. Lock order: cache, then partition.
    fn with_cache<T>(&self, op: impl FnOnce(Option<&mut LruCache<K, V>>) -> Result<T>) -> Result<T> {
        match &self.cache {
            Some(cache) => {
                let mut guard = cache.lock();
                op(Some(&mut *guard))
            }
            None => op(None),
        }
    }

    fn select_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT value FROM \"{}\" WHERE key = ?1", self.table);
        self.partition.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .query_row(params![key], |row| row.get(0))
                .optional()
        })
    }

    fn read(&self, key: &K) -> Result<Option<V>> {
        let k = self.keys.encode(key)?;
        self.with_cache(|mut cache| {
            if let Some(v) = cache.as_deref_mut().and_then(|c| c.get(key)) {
                return Ok(Some(v.clone()));
            }
            let value = self
                .select_raw(&k)?
                .map(|bytes| self.values.decode(&bytes))
                .transpose()?;
            if let (Some(c), Some(v)) = (cache, &value) {
                c.put(key.clone(), v.clone());
            }
            Ok(value)
        })
    }

    /// Replace the stored value and return the previous bytes, atomically.
    fn swap(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let select = format!("SELECT value FROM \"{}\" WHERE key = ?1", self.table);
        let upsert = format!(
            "INSERT INTO \"{}\" (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            self.table
        );
        self.partition.with_conn(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<Vec<u8>> = tx
                .prepare_cached(&select)?
                .query_row(params![key], |row| row.get(0))
                .optional()?;
            tx.prepare_cached(&upsert)?.execute(params![key, value])?;
            tx.commit()?;
            Ok(previous)
        })
    }

    fn write(&self, key: K, value: V) -> Result<()> {
        let upsert = format!(
            "INSERT INTO \"{}\" (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            self.table
        );
        let (k, v) = (self.keys.encode(&key)?, self.values.encode(&value)?);
        self.with_cache(|cache| {
            self.partition
                .with_conn(|conn| conn.prepare_cached(&upsert)?.execute(params![k, v]))?;
            if let Some(c) = cache {
                c.put(key, value);
            }
            Ok(())
        })
    }

    fn exchange(&self, key: K, value: V) -> Result<Option<V>> {
        let (k, v) = (self.keys.encode(&key)?, self.values.encode(&value)?);
        self.with_cache(|cache| {
            let previous = self.swap(&k, &v)?;
            if let Some(c) = cache {
                c.put(key, value);
            }
            previous.map(|b| self.values.decode(&b)).transpose()
        })
    }

    fn delete(&self, key: &K) -> Result<Option<V>> {
        let k = self.keys.encode(key)?;
        let select = format!("SELECT value FROM \"{}\" WHERE key = ?1", self.table);
        let delete = format!("DELETE FROM \"{}\" WHERE key = ?1", self.table);
        self.with_cache(|cache| {
            if let Some(c) = cache {
                c.pop(key);
            }
            let previous: Option<Vec<u8>> = self.partition.with_conn(|conn| {
                let tx = conn.transaction()?;
                let previous: Option<Vec<u8>> = tx
                    .prepare_cached(&select)?
                    .query_row(params![k], |row| row.get(0))
                    .optional()?;
                tx.prepare_cached(&delete)?.execute(params![k])?;
                tx.commit()?;
                Ok(previous)
            })?;
            previous.map(|b| self.values.decode(&b)).transpose()
        })
    }

    /// Visit rows page by page, releasing the partition between pages.
    ///
    /// Tree maps page by key, which is key order since every key encoding
    /// preserves `Ord`. Hash maps page by rowid.
    fn scan(&self, f: &mut dyn FnMut(K, V) -> Result<()>) -> Result<()> {
        match self.kind {
            MapKind::TreeMap => {
                let first = format!(
                    "SELECT key, value FROM \"{}\" ORDER BY key LIMIT ?1",
                    self.table
                );
                let next = format!(
                    "SELECT key, value FROM \"{}\" WHERE key > ?1 ORDER BY key LIMIT ?2",
                    self.table
                );
                let mut after: Option<Vec<u8>> = None;
                loop {
                    let page: Vec<(Vec<u8>, Vec<u8>)> = self.partition.with_conn(|conn| {
                        let mut stmt;
                        let rows = match &after {
                            None => {
                                stmt = conn.prepare_cached(&first)?;
                                stmt.query_map(params![PAGE_SIZE], key_value)?
                            }
                            Some(key) => {
                                stmt = conn.prepare_cached(&next)?;
                                stmt.query_map(params![key, PAGE_SIZE], key_value)?
                            }
                        };
                        rows.collect()
                    })?;
                    let full = page.len() as i64 == PAGE_SIZE;
                    after = page.last().map(|(k, _)| k.clone());
                    for (k, v) in page {
                        f(self.keys.decode(&k)?, self.values.decode(&v)?)?;
                    }
                    if !full {
                        return Ok(());
                    }
                }
            }
            MapKind::HashMap => {
                let sql = format!(
                    "SELECT rowid, key, value FROM \"{}\" WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                    self.table
                );
                let mut after: i64 = 0;
                loop {
                    let page: Vec<(i64, Vec<u8>, Vec<u8>)> = self.partition.with_conn(|conn| {
                        let mut stmt = conn.prepare_cached(&sql)?;
                        let rows = stmt.query_map(params![after, PAGE_SIZE], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                        })?;
                        rows.collect()
                    })?;
                    let full = page.len() as i64 == PAGE_SIZE;
                    if let Some((rowid, _, _)) = page.last() {
                        after = *rowid;
                    }
                    for (_, k, v) in page {
                        f(self.keys.decode(&k)?, self.values.decode(&v)?)?;
                    }
                    if !full {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn key_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, Vec<u8>)> {
    Ok((row.get(0)?, row.get(1)?))
}

impl<K: MapKey, V: MapValue> MapBackend<K, V> for DiskMap<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.check()?;
        self.liveness.guard(self.read(key))
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.check()?;
        self.liveness.guard(self.exchange(key, value))
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        self.check()?;
        self.liveness.guard(self.write(key, value))
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        self.check()?;
        self.liveness.guard(self.delete(key))
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        self.check()?;
        let result = self.keys.encode(key).and_then(|k| {
            self.with_cache(|cache| {
                if cache.is_some_and(|c| c.contains(key)) {
                    return Ok(true);
                }
                Ok(self.select_raw(&k)?.is_some())
            })
        });
        self.liveness.guard(result)
    }

    fn len(&self) -> Result<usize> {
        self.check()?;
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", self.table);
        let count: Result<i64> = self
            .partition
            .with_conn(|conn| conn.query_row(&sql, [], |row| row.get(0)));
        self.liveness.guard(count).map(|n| n as usize)
    }

    fn clear(&self) -> Result<()> {
        self.check()?;
        let sql = format!("DELETE FROM \"{}\"", self.table);
        let result = self.with_cache(|cache| {
            if let Some(c) = cache {
                c.clear();
            }
            self.partition.with_conn(|conn| conn.execute(&sql, []))
        });
        self.liveness.guard(result).map(|_| ())
    }

    fn for_each(&self, f: &mut dyn FnMut(K, V) -> Result<()>) -> Result<()> {
        self.check()?;
        self.liveness.guard(self.scan(f))
    }

    fn invalidate(&self) {
        self.dropped.store(true, Ordering::Release);
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::format::StorageType;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    fn map<K: MapKey, V: MapValue>(
        tmp: &TempDir,
        storage_type: StorageType,
        kind: MapKind,
        cache_size: usize,
    ) -> DiskMap<K, V> {
        let partition =
            Arc::new(Partition::open(&tmp.path().join(storage_type.file_name()), storage_type).unwrap());
        let record = partition
            .create_map(
                "m",
                kind,
                std::any::type_name::<K>(),
                std::any::type_name::<V>(),
                false,
            )
            .unwrap();
        DiskMap::new("m", &record.table, kind, partition, cache_size, Liveness::new("test"))
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    struct Pair(i32, String);

    #[test]
    fn insert_returns_previous() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<String, f64> = map(&tmp, StorageType::Secondary, MapKind::HashMap, 0);
        assert!(m.cache.is_none());
        assert_eq!(m.insert("a".into(), 1.0).unwrap(), None);
        assert_eq!(m.insert("a".into(), 2.0).unwrap(), Some(1.0));
        assert_eq!(m.get(&"a".to_string()).unwrap(), Some(2.0));
        assert_eq!(m.remove(&"a".to_string()).unwrap(), Some(2.0));
        assert_eq!(m.remove(&"a".to_string()).unwrap(), None);
        assert_eq!(m.len().unwrap(), 0);
    }

    #[test]
    fn cache_is_write_through() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<u64, String> = map(&tmp, StorageType::Primary, MapKind::HashMap, 2);
        assert!(m.cache.is_some());
        for i in 0..10u64 {
            m.put(i, format!("v{i}")).unwrap();
        }
        // Evicted entries are still on disk
        assert_eq!(m.get(&0).unwrap().as_deref(), Some("v0"));
        assert_eq!(m.len().unwrap(), 10);
        m.clear().unwrap();
        assert!(!m.contains_key(&9).unwrap());
    }

    #[test]
    fn tree_map_walks_in_key_order_across_pages() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<i64, u32> = map(&tmp, StorageType::Secondary, MapKind::TreeMap, 0);
        let n = PAGE_SIZE * 2 + 17;
        for i in (0..n).rev() {
            m.put(i - n / 2, i as u32).unwrap();
        }
        let mut keys = Vec::new();
        m.for_each(&mut |k, _| {
            keys.push(k);
            Ok(())
        })
        .unwrap();
        assert_eq!(keys.len() as i64, n);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys[0], -n / 2);
    }

    #[test]
    fn composite_keys_page_in_key_order() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<Pair, u8> = map(&tmp, StorageType::Secondary, MapKind::TreeMap, 0);
        let n = PAGE_SIZE as i32 + 40;
        let mut expected = Vec::new();
        for i in 0..n {
            // Interleave signs and string lengths so postcard order would differ
            let key = Pair(if i % 2 == 0 { i * 300 } else { -i }, "k".repeat((i % 5) as usize));
            m.put(key.clone(), (i % 251) as u8).unwrap();
            expected.push(key);
        }
        expected.sort();
        let mut keys = Vec::new();
        m.for_each(&mut |k, _| {
            keys.push(k);
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, expected);
    }

    #[test]
    fn cache_agrees_with_disk_under_contention() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<u32, u32> = map(&tmp, StorageType::Primary, MapKind::HashMap, 1 << 16);
        const KEYS: u32 = 1000;
        for k in 0..KEYS {
            m.put(k, 0).unwrap();
        }
        std::thread::scope(|s| {
            for w in 0..2u32 {
                let m = &m;
                s.spawn(move || {
                    for k in 0..KEYS {
                        m.remove(&k).unwrap();
                        m.put(k, w + 1).unwrap();
                        m.insert(k, w + 10).unwrap();
                    }
                });
            }
            for _ in 0..2 {
                let m = &m;
                s.spawn(move || {
                    for k in 0..KEYS {
                        for _ in 0..3 {
                            m.get(&k).unwrap();
                            m.contains_key(&k).unwrap();
                        }
                    }
                });
            }
        });

        let cache = m.cache.as_ref().unwrap().lock();
        assert!(!cache.is_empty());
        for (k, v) in cache.iter() {
            let raw = m.select_raw(&m.keys.encode(k).unwrap()).unwrap();
            let on_disk = raw.map(|b| m.values.decode(&b).unwrap());
            assert_eq!(on_disk, Some(*v), "cached value for {k} differs from disk");
        }
    }

    #[test]
    fn hash_map_visits_every_row() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<u32, u32> = map(&tmp, StorageType::TemporarySecondary, MapKind::HashMap, 0);
        for i in 0..(PAGE_SIZE as u32 + 5) {
            m.put(i, i * 2).unwrap();
        }
        m.remove(&3).unwrap();
        let mut sum = 0u64;
        let mut count = 0;
        m.for_each(&mut |k, v| {
            assert_eq!(v, k * 2);
            sum += k as u64;
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, PAGE_SIZE as usize + 4);
        let total: u64 = (0..(PAGE_SIZE as u64 + 5)).sum();
        assert_eq!(sum, total - 3);
    }

    #[test]
    fn invalidated_map_is_unusable() {
        let tmp = TempDir::new().unwrap();
        let m: DiskMap<u32, u32> = map(&tmp, StorageType::Primary, MapKind::HashMap, 4);
        m.put(1, 1).unwrap();
        m.invalidate();
        assert!(matches!(m.get(&1), Err(StorageError::InvalidState(_))));
    }
}
