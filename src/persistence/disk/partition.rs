//! One paged partition file.
//!
//! A partition is a SQLite database holding a catalog of its big maps, one
//! table per map, and (in the primary partition) the engine's named
//! objects.
//!
//! ```text
//! big_maps(name PK, table_name, kind, key_type, value_type, concurrent, created_at)
//! objects(name PK, payload)
//! map_<hex(name)>(key, value)   -- TREEMAP: WITHOUT ROWID, key PK
//!                               -- HASHMAP: rowid table, key UNIQUE
//! ```

use crate::error::{Result, StorageError};
use crate::persistence::format::{MapKind, StorageType};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS big_maps (
    name        TEXT PRIMARY KEY,
    table_name  TEXT NOT NULL UNIQUE,
    kind        TEXT NOT NULL,
    key_type    TEXT NOT NULL,
    value_type  TEXT NOT NULL,
    concurrent  INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS objects (
    name     TEXT PRIMARY KEY,
    payload  BLOB NOT NULL
);
";

/// Catalog row for one big map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MapRecord {
    pub(crate) table: String,
    pub(crate) kind: MapKind,
    pub(crate) key_type: String,
    pub(crate) value_type: String,
}

pub(crate) struct Partition {
    storage_type: StorageType,
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl Partition {
    pub(crate) fn open(path: &Path, storage_type: StorageType) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), ?storage_type, "opened partition");
        Ok(Self {
            storage_type,
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub(crate) fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// Run `f` on the connection. Fails with `AlreadyClosed` after `close`.
    pub(crate) fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| StorageError::closed(&self.path.display().to_string()))?;
        Ok(f(conn)?)
    }

    pub(crate) fn map_record(&self, name: &str) -> Result<Option<MapRecord>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT table_name, kind, key_type, value_type FROM big_maps WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
        })?;
        row.map(|(table, kind, key_type, value_type)| {
            let kind = MapKind::parse(&kind).ok_or_else(|| {
                StorageError::Deserialization(format!("unknown map kind {kind:?} for {name:?}"))
            })?;
            Ok(MapRecord {
                table,
                kind,
                key_type,
                value_type,
            })
        })
        .transpose()
    }

    pub(crate) fn has_map(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM big_maps WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
        })
        .map(|row| row.is_some())
    }

    pub(crate) fn create_map(
        &self,
        name: &str,
        kind: MapKind,
        key_type: &str,
        value_type: &str,
        concurrent: bool,
    ) -> Result<MapRecord> {
        let table = table_name(name);
        let ddl = match kind {
            MapKind::TreeMap => format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID"
            ),
            MapKind::HashMap => format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (key BLOB NOT NULL UNIQUE, value BLOB NOT NULL)"
            ),
        };
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(&ddl, [])?;
            tx.execute(
                "INSERT INTO big_maps (name, table_name, kind, key_type, value_type, concurrent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    name,
                    table,
                    kind.as_str(),
                    key_type,
                    value_type,
                    concurrent,
                    unix_millis()
                ],
            )?;
            tx.commit()
        })?;
        debug!(partition = ?self.storage_type, map = name, table = %table, "created map table");
        Ok(MapRecord {
            table,
            kind,
            key_type: key_type.to_string(),
            value_type: value_type.to_string(),
        })
    }

    /// Drop a map's table and catalog row. Returns whether it existed.
    pub(crate) fn drop_map(&self, name: &str) -> Result<bool> {
        let Some(record) = self.map_record(name)? else {
            return Ok(false);
        };
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(&format!("DROP TABLE IF EXISTS \"{}\"", record.table), [])?;
            tx.execute("DELETE FROM big_maps WHERE name = ?1", params![name])?;
            tx.commit()
        })?;
        Ok(true)
    }

    pub(crate) fn object_exists(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM objects WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
        })
        .map(|row| row.is_some())
    }

    pub(crate) fn get_object(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT payload FROM objects WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub(crate) fn put_object(&self, name: &str, payload: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO objects (name, payload) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET payload = excluded.payload",
                params![name, payload],
            )
        })
        .map(|_| ())
    }

    pub(crate) fn delete_object(&self, name: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM objects WHERE name = ?1", params![name]))
            .map(|_| ())
    }

    /// Checkpoint and release the file. Later calls are no-ops.
    pub(crate) fn close(&self) -> Result<()> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StorageError::Database(e))?;
        debug!(path = %self.path.display(), "closed partition");
        Ok(())
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub(crate) fn table_name(map_name: &str) -> String {
    format!("map_{}", hex::encode(map_name.as_bytes()))
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
