//! Persistence façade for one trainable component.

use crate::config::StorageConfiguration;
use crate::error::{Result, StorageError};
use crate::knowledge::parameters::{MapBinder, ModelParameters, TrainingParameters};
use crate::persistence::{Engine, StorageEngine};
use tracing::{debug, info};

/// Object key of the model parameters.
pub const MODEL_PARAMETERS_KEY: &str = "modelParameters";

/// Object key of the training parameters.
pub const TRAINING_PARAMETERS_KEY: &str = "trainingParameters";

/// Binds a component's parameter objects to an engine.
///
/// Big-map fields of the model parameters are always bound: on creation,
/// after `load`, after `clear` and after `rename`.
#[derive(Debug)]
pub struct KnowledgeBase<MP, TP> {
    engine: Engine,
    model_parameters: MP,
    training_parameters: TP,
}

impl<MP: ModelParameters, TP: TrainingParameters> KnowledgeBase<MP, TP> {
    /// Start from fresh model parameters.
    pub fn create(
        storage_name: &str,
        config: &StorageConfiguration,
        training_parameters: TP,
    ) -> Result<Self> {
        let engine = config.open(storage_name)?;
        Self::with_engine(engine, MP::default(), training_parameters)
    }

    /// Load what a previous `save` stored. `NotFound` if nothing was saved.
    pub fn load(storage_name: &str, config: &StorageConfiguration) -> Result<Self> {
        let engine = config.open(storage_name)?;
        let model_parameters: MP = engine.load_object(MODEL_PARAMETERS_KEY)?;
        let training_parameters: TP = engine.load_object(TRAINING_PARAMETERS_KEY)?;
        info!(storage = storage_name, "loaded knowledge base");
        Self::with_engine(engine, model_parameters, training_parameters)
    }

    /// `load`, or `create` with default training parameters if nothing was saved.
    pub fn open(storage_name: &str, config: &StorageConfiguration) -> Result<Self> {
        match Self::load(storage_name, config) {
            Err(StorageError::NotFound(_)) => Self::create(storage_name, config, TP::default()),
            other => other,
        }
    }

    /// Wrap an already-open engine.
    pub fn with_engine(engine: Engine, model_parameters: MP, training_parameters: TP) -> Result<Self> {
        let mut kb = Self {
            engine,
            model_parameters,
            training_parameters,
        };
        kb.materialize()?;
        Ok(kb)
    }

    fn materialize(&mut self) -> Result<()> {
        let mut binder = MapBinder::new(&self.engine, MP::big_map_fields())?;
        self.model_parameters.bind_big_maps(&mut binder)?;
        binder.finish()
    }

    pub fn storage_name(&self) -> String {
        self.engine.storage_name()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn model_parameters(&self) -> &MP {
        &self.model_parameters
    }

    pub fn model_parameters_mut(&mut self) -> &mut MP {
        &mut self.model_parameters
    }

    pub fn training_parameters(&self) -> &TP {
        &self.training_parameters
    }

    pub fn training_parameters_mut(&mut self) -> &mut TP {
        &mut self.training_parameters
    }

    pub fn set_training_parameters(&mut self, training_parameters: TP) {
        self.training_parameters = training_parameters;
    }

    /// Persist both parameter objects. Big maps persist on their own.
    pub fn save(&self) -> Result<()> {
        self.engine
            .save_object(MODEL_PARAMETERS_KEY, &self.model_parameters)?;
        self.engine
            .save_object(TRAINING_PARAMETERS_KEY, &self.training_parameters)?;
        debug!(storage = %self.engine.storage_name(), "saved knowledge base");
        Ok(())
    }

    /// Drop every declared big map and start over from defaults.
    ///
    /// Saved objects are left alone until the next `save`.
    pub fn clear(&mut self) -> Result<()> {
        for field in MP::big_map_fields() {
            self.engine.drop_big_map(field.name())?;
        }
        self.model_parameters = MP::default();
        self.training_parameters = TP::default();
        self.materialize()?;
        info!(storage = %self.engine.storage_name(), "cleared knowledge base");
        Ok(())
    }

    /// Remove everything stored for this component and close it.
    pub fn delete(&mut self) -> Result<()> {
        let name = self.engine.storage_name();
        self.clear()?;
        self.engine.drop_object(MODEL_PARAMETERS_KEY)?;
        self.engine.drop_object(TRAINING_PARAMETERS_KEY)?;
        self.engine.clear()?;
        self.engine.close()?;
        info!(storage = %name, "deleted knowledge base");
        Ok(())
    }

    /// Move to `new_name`. Returns `false` when unchanged.
    pub fn rename(&mut self, new_name: &str) -> Result<bool> {
        if !self.engine.rename(new_name)? {
            return Ok(false);
        }
        self.materialize()?;
        Ok(true)
    }

    pub fn close(&mut self) -> Result<()> {
        self.engine.close()
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Take the parameter objects, closing the engine.
    pub fn into_parts(mut self) -> Result<(MP, TP)> {
        self.engine.close()?;
        let Self {
            model_parameters,
            training_parameters,
            ..
        } = self;
        Ok((model_parameters, training_parameters))
    }
}
