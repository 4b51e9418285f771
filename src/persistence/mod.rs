//! Storage engines for named objects and big maps.
//!
//! Two backends implement [`StorageEngine`]:
//!
//! - [`InMemoryEngine`]: everything resident; named objects are also
//!   snapshotted under the storage root so another process can load them.
//! - [`DiskEngine`]: named objects and big maps in paged partition files,
//!   with an LRU of hot entries for primary-partition maps.
//!
//! [`Engine`] picks one of them once, from a
//! [`StorageConfiguration`](crate::StorageConfiguration).
//!
//! See [`format`] for the on-disk layout and the storage-type table.

pub mod big_map;
pub mod blob_store;
pub mod codec;
pub mod directory;
mod disk;
pub(crate) mod encoding;
pub mod engine;
pub mod format;
mod memory;
mod ordered;

pub use big_map::{BigMap, MapKey, MapValue};
pub use disk::DiskEngine;
pub use engine::{Engine, StorageEngine};
pub use format::{MapKind, MapOptions, StorageHint, StorageManifest, StorageType};
pub use memory::InMemoryEngine;
