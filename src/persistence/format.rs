//! On-disk layout, partition taxonomy and big-map attributes.
//!
//! # Storage Root Layout
//!
//! ```text
//! <root_directory>/<name>/
//! ├── manifest.json          # StorageManifest: version, name, backend
//! ├── PRIMARY_STORAGE        # disk backend: named objects + cached maps
//! ├── SECONDARY_STORAGE      # disk backend: uncached maps
//! ├── OBJECTS/               # in-memory backend: object snapshots
//! │   └── <hex(name)>.obj
//! └── <tag>/                 # bundle members: <name><separator><tag>
//! ```
//!
//! Temporary partitions never live under the root; they are created in a
//! process temp directory that is removed when the engine closes.
//!
//! # StorageType Selection
//!
//! | temporary | hint                    | storage type         |
//! |-----------|-------------------------|----------------------|
//! | no        | `InMemory` / `InCache`  | `Primary`            |
//! | no        | `InDisk`                | `Secondary`          |
//! | yes       | `InMemory` / `InCache`  | `TemporaryPrimary`   |
//! | yes       | `InDisk`                | `TemporarySecondary` |

use crate::config::BackendKind;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current storage root format version.
pub const FORMAT_VERSION: u32 = 1;

/// Manifest file name inside a storage root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory holding the in-memory backend's object snapshots.
pub const OBJECTS_DIR: &str = "OBJECTS";

/// Ordering of a big map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapKind {
    /// Hash-ordered; iteration order unspecified.
    HashMap,
    /// Sort-ordered; iteration in ascending key order.
    TreeMap,
}

impl MapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapKind::HashMap => "HASHMAP",
            MapKind::TreeMap => "TREEMAP",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "HASHMAP" => Some(MapKind::HashMap),
            "TREEMAP" => Some(MapKind::TreeMap),
            _ => None,
        }
    }
}

/// Caller preference for where a big map should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageHint {
    InMemory,
    InCache,
    InDisk,
}

/// The engine's partition for a big map, fixed at first creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageType {
    /// Permanent, cache-eligible.
    Primary,
    /// Permanent, never cached.
    Secondary,
    /// Discarded on close, cache-eligible.
    TemporaryPrimary,
    /// Discarded on close, never cached.
    TemporarySecondary,
}

impl StorageType {
    /// Probe order used when resolving which partition holds a name.
    pub const PRIORITY: [StorageType; 4] = [
        StorageType::Primary,
        StorageType::Secondary,
        StorageType::TemporaryPrimary,
        StorageType::TemporarySecondary,
    ];

    /// Select the partition for a new big map. Pure and deterministic.
    pub fn select(temporary: bool, hint: StorageHint) -> Self {
        match (temporary, hint) {
            (false, StorageHint::InMemory | StorageHint::InCache) => StorageType::Primary,
            (false, StorageHint::InDisk) => StorageType::Secondary,
            (true, StorageHint::InMemory | StorageHint::InCache) => StorageType::TemporaryPrimary,
            (true, StorageHint::InDisk) => StorageType::TemporarySecondary,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            StorageType::TemporaryPrimary | StorageType::TemporarySecondary
        )
    }

    pub fn is_cache_eligible(&self) -> bool {
        matches!(self, StorageType::Primary | StorageType::TemporaryPrimary)
    }

    /// Partition file name.
    pub fn file_name(&self) -> &'static str {
        match self {
            StorageType::Primary => "PRIMARY_STORAGE",
            StorageType::Secondary => "SECONDARY_STORAGE",
            StorageType::TemporaryPrimary => "TEMP_PRIMARY_STORAGE",
            StorageType::TemporarySecondary => "TEMP_SECONDARY_STORAGE",
        }
    }
}

/// Attributes requested for a big map.
///
/// Only `kind` and the key/value types are binding once a map exists; `hint`
/// and `temporary` are consulted on first creation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    pub kind: MapKind,
    pub hint: StorageHint,
    pub concurrent: bool,
    pub temporary: bool,
    /// Expected number of entries; pre-sizes in-memory hash maps.
    pub capacity: Option<usize>,
}

impl MapOptions {
    pub fn new(kind: MapKind) -> Self {
        Self {
            kind,
            hint: StorageHint::InMemory,
            concurrent: false,
            temporary: false,
            capacity: None,
        }
    }

    pub fn hash_map() -> Self {
        Self::new(MapKind::HashMap)
    }

    pub fn tree_map() -> Self {
        Self::new(MapKind::TreeMap)
    }

    pub fn hint(mut self, hint: StorageHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn storage_type(&self) -> StorageType {
        StorageType::select(self.temporary, self.hint)
    }
}

/// Manifest written at the top of every storage root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageManifest {
    /// Format version
    pub version: u32,
    /// Storage name that owns the root
    pub storage_name: String,
    /// Backend that wrote the root
    pub backend: BackendKind,
    /// Creation timestamp (Unix millis)
    pub created_at: u64,
    /// Last modified timestamp (Unix millis)
    pub modified_at: u64,
}

impl StorageManifest {
    pub fn new(storage_name: &str, backend: BackendKind) -> Self {
        let now = unix_millis();
        Self {
            version: FORMAT_VERSION,
            storage_name: storage_name.to_string(),
            backend,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = unix_millis();
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_type_selection_table() {
        use StorageHint::*;
        assert_eq!(StorageType::select(false, InMemory), StorageType::Primary);
        assert_eq!(StorageType::select(false, InCache), StorageType::Primary);
        assert_eq!(StorageType::select(false, InDisk), StorageType::Secondary);
        assert_eq!(StorageType::select(true, InMemory), StorageType::TemporaryPrimary);
        assert_eq!(StorageType::select(true, InCache), StorageType::TemporaryPrimary);
        assert_eq!(StorageType::select(true, InDisk), StorageType::TemporarySecondary);
    }

    #[test]
    fn cache_eligibility_follows_primary() {
        assert!(StorageType::Primary.is_cache_eligible());
        assert!(StorageType::TemporaryPrimary.is_cache_eligible());
        assert!(!StorageType::Secondary.is_cache_eligible());
        assert!(!StorageType::TemporarySecondary.is_cache_eligible());
    }

    #[test]
    fn map_kind_names_roundtrip() {
        for kind in [MapKind::HashMap, MapKind::TreeMap] {
            assert_eq!(MapKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MapKind::parse("SKIPLIST"), None);
    }

    #[test]
    fn manifest_serde() {
        let manifest = StorageManifest::new("demo", BackendKind::Disk);
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let parsed: StorageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.version, FORMAT_VERSION);
    }
}
