//! knowledge-store: persistence for the learned state of trainable components.
//!
//! A trained component carries two kinds of state: small parameter objects
//! (coefficients, settings) and potentially huge key-value structures
//! (vocabularies, similarity matrices, co-occurrence counts). This crate
//! stores both under a storage name, with one of two interchangeable
//! backends:
//!
//! - `in_memory`: everything resident, parameter objects snapshotted to files
//! - `disk`: paged SQLite partitions with an LRU of hot entries
//!
//! # Layers
//!
//! - [`persistence`]: the [`StorageEngine`] contract, both backends, and
//!   [`BigMap`] handles
//! - [`knowledge`]: [`KnowledgeBase`], binding model and training parameters
//!   (and their declared big maps) to an engine
//! - [`bundle`]: [`TrainableBundle`], several components under one name
//! - [`predict`]: [`ParallelPredictBuffer`], concurrent prediction through a
//!   scratch map
//!
//! # Example
//!
//! ```
//! use knowledge_store::{MapOptions, StorageConfiguration, StorageEngine, StorageHint};
//!
//! # fn main() -> knowledge_store::Result<()> {
//! let root = tempfile::tempdir()?;
//! let config = StorageConfiguration::disk(root.path()).with_cache_size(1024);
//! let mut engine = config.open("sentiment")?;
//!
//! engine.save_object("threshold", &0.5f64)?;
//! let counts = engine.get_big_map::<String, u64>(
//!     "token_counts",
//!     MapOptions::tree_map().hint(StorageHint::InDisk),
//! )?;
//! counts.insert("good".to_string(), 3)?;
//! engine.close()?;
//!
//! let engine = config.open("sentiment")?;
//! assert_eq!(engine.load_object::<f64>("threshold")?, 0.5);
//! # Ok(())
//! # }
//! ```
//!
//! # Lifecycle
//!
//! Handles never outlive the engine state they came from. Closing or
//! clearing an engine invalidates every [`BigMap`] it issued, and an I/O
//! failure closes the engine; recovery means opening a new one.
//!
//! No cross-process locking is done: open at most one engine per storage
//! name at a time.

pub mod bundle;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod persistence;
pub mod predict;

pub use bundle::{Trainable, TrainableBundle};
pub use config::{BackendKind, ConfigError, StorageConfiguration};
pub use error::{Result, StorageError};
pub use knowledge::{BigMapField, KnowledgeBase, MapBinder, ModelParameters, TrainingParameters};
pub use persistence::{
    BigMap, DiskEngine, Engine, InMemoryEngine, MapKey, MapKind, MapOptions, MapValue,
    StorageEngine, StorageHint, StorageType,
};
pub use predict::ParallelPredictBuffer;
