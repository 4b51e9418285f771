//! Knowledge bases: parameter objects bound to a storage engine.

mod knowledge_base;
mod parameters;

pub use knowledge_base::{KnowledgeBase, MODEL_PARAMETERS_KEY, TRAINING_PARAMETERS_KEY};
pub use parameters::{BigMapField, MapBinder, ModelParameters, TrainingParameters};
