//! Several trainable components under one storage name.
//!
//! Each member is stored under `<base><separator><tag>`, a directory nested
//! inside the bundle's own root. Members are loaded lazily, on first access
//! to their tag, and cached for the life of the bundle.

use crate::config::StorageConfiguration;
use crate::error::{Result, StorageError};
use crate::knowledge::{KnowledgeBase, ModelParameters, TrainingParameters};
use crate::persistence::{Engine, StorageEngine};
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Object key of the saved tag list.
pub const BUNDLE_TAGS_KEY: &str = "bundleTags";

/// A component whose lifecycle a bundle drives.
pub trait Trainable: Any + Send {
    fn storage_name(&self) -> String;
    fn save(&self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Remove everything the component stored, then close it.
    fn delete(&mut self) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<MP: ModelParameters, TP: TrainingParameters> Trainable for KnowledgeBase<MP, TP> {
    fn storage_name(&self) -> String {
        KnowledgeBase::storage_name(self)
    }

    fn save(&self) -> Result<()> {
        KnowledgeBase::save(self)
    }

    fn close(&mut self) -> Result<()> {
        KnowledgeBase::close(self)
    }

    fn delete(&mut self) -> Result<()> {
        KnowledgeBase::delete(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct TrainableBundle {
    config: StorageConfiguration,
    engine: Engine,
    members: BTreeMap<String, Box<dyn Trainable>>,
}

impl TrainableBundle {
    pub fn new(storage_name: &str, config: &StorageConfiguration) -> Result<Self> {
        let engine = config.open(storage_name)?;
        Ok(Self {
            config: config.clone(),
            engine,
            members: BTreeMap::new(),
        })
    }

    pub fn storage_name(&self) -> String {
        self.engine.storage_name()
    }

    pub fn config(&self) -> &StorageConfiguration {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Storage name of the member at `tag`.
    pub fn sub_storage_name(&self, tag: &str) -> Result<String> {
        self.config.compose_name(&self.engine.storage_name(), tag)
    }

    /// Cache `component` under `tag`, returning the one it replaces.
    pub fn put<T: Trainable>(&mut self, tag: &str, component: T) -> Result<Option<Box<dyn Trainable>>> {
        self.sub_storage_name(tag)?;
        Ok(self.members.insert(tag.to_string(), Box::new(component)))
    }

    pub fn get(&self, tag: &str) -> Option<&dyn Trainable> {
        self.members.get(tag).map(|m| m.as_ref())
    }

    pub fn get_mut(&mut self, tag: &str) -> Option<&mut (dyn Trainable + 'static)> {
        self.members.get_mut(tag).map(|m| m.as_mut())
    }

    /// The member at `tag`, if it is a `T`.
    pub fn get_as<T: Trainable>(&self, tag: &str) -> Option<&T> {
        self.members.get(tag)?.as_any().downcast_ref()
    }

    pub fn get_mut_as<T: Trainable>(&mut self, tag: &str) -> Option<&mut T> {
        self.members.get_mut(tag)?.as_any_mut().downcast_mut()
    }

    pub fn contains_key(&self, tag: &str) -> bool {
        self.members.contains_key(tag)
    }

    /// Tags of the cached members, in order.
    pub fn tags(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The member at `tag`, built by `loader` on a cache miss.
    ///
    /// `loader` receives the member's storage name and the bundle's
    /// configuration.
    pub fn get_or_load<T, F>(&mut self, tag: &str, loader: F) -> Result<&mut T>
    where
        T: Trainable,
        F: FnOnce(&str, &StorageConfiguration) -> Result<T>,
    {
        if !self.members.contains_key(tag) {
            let name = self.sub_storage_name(tag)?;
            let component = loader(&name, &self.config)?;
            debug!(bundle = %self.engine.storage_name(), tag, "loaded bundle member");
            self.members.insert(tag.to_string(), Box::new(component));
        }
        self.members
            .get_mut(tag)
            .and_then(|m| m.as_any_mut().downcast_mut::<T>())
            .ok_or_else(|| StorageError::type_mismatch(type_name::<T>(), format!("member {tag:?}")))
    }

    /// Save every member and the tag list.
    pub fn save(&self) -> Result<()> {
        for member in self.members.values() {
            member.save()?;
        }
        self.engine.save_object(BUNDLE_TAGS_KEY, &self.tags())?;
        debug!(bundle = %self.engine.storage_name(), members = self.members.len(), "saved bundle");
        Ok(())
    }

    /// Tags recorded by the last `save`; empty if never saved.
    pub fn stored_tags(&self) -> Result<Vec<String>> {
        match self.engine.load_object(BUNDLE_TAGS_KEY) {
            Err(StorageError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Delete every member, then the bundle's own storage, and close.
    pub fn delete(&mut self) -> Result<()> {
        let name = self.engine.storage_name();
        for (tag, mut member) in std::mem::take(&mut self.members) {
            debug!(bundle = %name, tag = %tag, "deleting bundle member");
            member.delete()?;
        }
        self.engine.drop_object(BUNDLE_TAGS_KEY)?;
        self.engine.clear()?;
        self.engine.close()?;
        info!(bundle = %name, "deleted bundle");
        Ok(())
    }

    /// Close every member, then the bundle.
    pub fn close(&mut self) -> Result<()> {
        for member in self.members.values_mut() {
            member.close()?;
        }
        self.engine.close()
    }
}

impl fmt::Debug for TrainableBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainableBundle")
            .field("storage_name", &self.engine.storage_name())
            .field("tags", &self.tags())
            .finish()
    }
}
