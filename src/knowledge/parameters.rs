//! Parameter objects and explicit big-map registration.
//!
//! Model parameters declare their big-map fields up front instead of being
//! inspected at runtime:
//!
//! ```
//! use knowledge_store::knowledge::{BigMapField, MapBinder, ModelParameters};
//! use knowledge_store::{BigMap, MapKind, Result, StorageHint};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Vocabulary {
//!     min_count: u32,
//!     #[serde(skip)]
//!     counts: BigMap<String, u64>,
//! }
//!
//! impl ModelParameters for Vocabulary {
//!     fn big_map_fields() -> Vec<BigMapField> {
//!         vec![BigMapField::new::<String, u64>(
//!             "counts",
//!             MapKind::HashMap,
//!             StorageHint::InDisk,
//!             false,
//!         )]
//!     }
//!
//!     fn bind_big_maps(&mut self, binder: &mut MapBinder<'_>) -> Result<()> {
//!         binder.bind("counts", &mut self.counts)
//!     }
//! }
//! ```
//!
//! Big-map fields must be `#[serde(skip)]`: their contents belong to the
//! engine, not to the serialized parameter object.

use crate::error::{Result, StorageError};
use crate::persistence::{BigMap, Engine, MapKey, MapKind, MapOptions, MapValue, StorageEngine, StorageHint};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::collections::HashSet;

/// Declaration of one big-map field of a model-parameters type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigMapField {
    name: String,
    key_type: &'static str,
    value_type: &'static str,
    kind: MapKind,
    hint: StorageHint,
    concurrent: bool,
}

impl BigMapField {
    pub fn new<K: MapKey, V: MapValue>(
        name: impl Into<String>,
        kind: MapKind,
        hint: StorageHint,
        concurrent: bool,
    ) -> Self {
        Self {
            name: name.into(),
            key_type: type_name::<K>(),
            value_type: type_name::<V>(),
            kind,
            hint,
            concurrent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_type(&self) -> &'static str {
        self.key_type
    }

    pub fn value_type(&self) -> &'static str {
        self.value_type
    }

    pub fn kind(&self) -> MapKind {
        self.kind
    }

    pub fn hint(&self) -> StorageHint {
        self.hint
    }

    pub fn concurrent(&self) -> bool {
        self.concurrent
    }

    /// Options used to materialize the field. Parameter maps are permanent.
    pub fn options(&self) -> MapOptions {
        MapOptions::new(self.kind)
            .hint(self.hint)
            .concurrent(self.concurrent)
    }
}

/// Learned state of a component.
pub trait ModelParameters: Default + Serialize + DeserializeOwned + Send + 'static {
    /// Every big-map field of the type. Names must be unique.
    fn big_map_fields() -> Vec<BigMapField> {
        Vec::new()
    }

    /// Hand every declared field to `binder`.
    fn bind_big_maps(&mut self, binder: &mut MapBinder<'_>) -> Result<()> {
        let _ = binder;
        Ok(())
    }
}

/// Hyperparameters a component was trained with.
pub trait TrainingParameters: Serialize + DeserializeOwned + Default + Send + 'static {}

impl<T> TrainingParameters for T where T: Serialize + DeserializeOwned + Default + Send + 'static {}

/// Materializes declared big-map fields from an engine.
pub struct MapBinder<'a> {
    engine: &'a Engine,
    fields: Vec<BigMapField>,
    bound: HashSet<String>,
}

impl<'a> MapBinder<'a> {
    pub(crate) fn new(engine: &'a Engine, fields: Vec<BigMapField>) -> Result<Self> {
        {
            let mut seen = HashSet::new();
            for field in &fields {
                if !seen.insert(field.name.as_str()) {
                    return Err(StorageError::InvalidConfiguration(format!(
                        "big map field {:?} is declared twice",
                        field.name
                    )));
                }
            }
        }
        Ok(Self {
            engine,
            fields,
            bound: HashSet::new(),
        })
    }

    /// Point `slot` at the engine's map for the declared field `name`.
    pub fn bind<K: MapKey, V: MapValue>(&mut self, name: &str, slot: &mut BigMap<K, V>) -> Result<()> {
        let field = self
            .fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                StorageError::InvalidConfiguration(format!("big map field {name:?} is not declared"))
            })?;
        if field.key_type != type_name::<K>() || field.value_type != type_name::<V>() {
            return Err(StorageError::type_mismatch(
                format!("({}, {})", field.key_type, field.value_type),
                format!("({}, {})", type_name::<K>(), type_name::<V>()),
            ));
        }
        *slot = self.engine.get_big_map(name, field.options())?;
        self.bound.insert(name.to_string());
        Ok(())
    }

    /// Fail if a declared field was never bound.
    pub(crate) fn finish(self) -> Result<()> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| !self.bound.contains(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StorageError::InvalidState(format!(
                "declared big map fields were not bound: {}",
                missing.join(", ")
            )))
        }
    }
}
