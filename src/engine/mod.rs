mod lifecycle;
mod preflight;

use std::sync::Arc;

use llm_host_models::ModelSettings;
use parking_lot::Mutex;

use crate::native::InferenceBackend;
use crate::registry::HandleRegistry;

pub struct EngineEntry<B: InferenceBackend> {
    settings: ModelSettings,
    /// Shared with every native session built from this engine.
    pub(crate) native: Arc<Mutex<B::Engine>>,
}

impl<B: InferenceBackend> EngineEntry<B> {
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Check the model file on disk before handing the path to the backend.
    pub preflight_model_file: bool,
}

pub struct EngineManager<B: InferenceBackend> {
    pub(super) backend: Arc<B>,
    pub(super) engines: HandleRegistry<Arc<EngineEntry<B>>>,
    pub(super) options: EngineOptions,
}
