use std::path::Path;
use std::sync::Arc;

use llm_host_models::ModelSettings;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HostError, Result};
use crate::native::InferenceBackend;
use crate::registry::HandleRegistry;
use crate::session::SessionManager;

use super::preflight::check_model_file;
use super::{EngineEntry, EngineManager, EngineOptions};

impl<B: InferenceBackend> EngineManager<B> {
    pub fn new(backend: Arc<B>, options: EngineOptions) -> Self {
        Self {
            backend,
            engines: HandleRegistry::new(),
            options,
        }
    }

    pub fn create_engine(&self, settings: ModelSettings) -> Result<String> {
        info!(
            model_path = %settings.model_path,
            max_num_tokens = settings.effective_max_num_tokens(),
            "loading engine"
        );

        if self.options.preflight_model_file {
            let size = check_model_file(Path::new(&settings.model_path)).map_err(|message| {
                warn!(model_path = %settings.model_path, %message, "model preflight failed");
                HostError::EngineCreation { message }
            })?;
            debug!(model_path = %settings.model_path, size_bytes = size, "model preflight passed");
        }

        let native = self.backend.create_engine(&settings).map_err(|err| {
            warn!(model_path = %settings.model_path, error = %err, "native engine factory failed");
            HostError::EngineCreation {
                message: err.message,
            }
        })?;

        let entry = EngineEntry {
            settings,
            native: Arc::new(Mutex::new(native)),
        };
        let engine_id = self.engines.insert(Arc::new(entry))?;
        info!(engine_id = %engine_id, "engine ready");
        Ok(engine_id)
    }

    /// Deletes the engine and, first, every session bound to it. Unknown ids
    /// are ignored.
    pub fn delete_engine(&self, engine_id: &str, sessions: &SessionManager<B>) {
        let Some(entry) = self.engines.remove(engine_id) else {
            debug!(engine_id, "delete of unknown engine ignored");
            return;
        };

        let removed = sessions.delete_sessions_for_engine(engine_id);
        if Arc::strong_count(&entry.native) > 1 {
            debug!(engine_id, "native engine release deferred to running predictions");
        }
        drop(entry);
        info!(engine_id, sessions = removed, "engine deleted");
    }

    pub(crate) fn lookup(&self, engine_id: &str) -> Option<Arc<EngineEntry<B>>> {
        self.engines.get(engine_id)
    }

    pub fn settings(&self, engine_id: &str) -> Result<ModelSettings> {
        self.lookup(engine_id)
            .map(|entry| entry.settings().clone())
            .ok_or_else(|| HostError::EngineNotFound {
                engine_id: engine_id.to_string(),
            })
    }

    pub fn contains(&self, engine_id: &str) -> bool {
        self.engines.contains(engine_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.engines.ids()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Releases every engine. Sessions must already be gone.
    pub(crate) fn shutdown(&self) -> usize {
        let drained = self.engines.drain();
        let count = drained.len();
        for (engine_id, entry) in drained {
            drop(entry);
            debug!(engine_id = %engine_id, "engine released");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use llm_host_models::{ModelSettings, SessionConfig};

    use crate::engine::{EngineManager, EngineOptions};
    use crate::error::HostError;
    use crate::native::StubBackend;
    use crate::session::SessionManager;

    fn managers(
        options: EngineOptions,
    ) -> (StubBackend, Arc<EngineManager<StubBackend>>, SessionManager<StubBackend>) {
        let stub = StubBackend::new();
        let backend = Arc::new(stub.clone());
        let engines = Arc::new(EngineManager::new(backend.clone(), options));
        let sessions = SessionManager::new(backend, engines.clone());
        (stub, engines, sessions)
    }

    #[test]
    fn create_engine_registers_settings() {
        let (stub, engines, _) = managers(EngineOptions::default());
        let id = engines
            .create_engine(ModelSettings::new("m.bin").with_max_num_tokens(512))
            .expect("engine");

        assert_eq!(id.len(), 32);
        assert!(engines.contains(&id));
        assert_eq!(engines.settings(&id).expect("settings").max_num_tokens, Some(512));
        assert_eq!(stub.live_engines(), 1);
    }

    #[test]
    fn native_failure_carries_the_diagnostic() {
        let (stub, engines, _) = managers(EngineOptions::default());
        let err = engines
            .create_engine(ModelSettings::new("/models/missing.bin"))
            .expect_err("missing model");

        match err {
            HostError::EngineCreation { message } => {
                assert_eq!(message, "Failed to open model file: /models/missing.bin")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(engines.is_empty());
        assert_eq!(stub.live_engines(), 0);
    }

    #[test]
    fn delete_cascades_to_sessions_before_the_engine() {
        let (stub, engines, sessions) = managers(EngineOptions::default());
        let engine_id = engines.create_engine(ModelSettings::new("m.bin")).expect("engine");
        let other = engines.create_engine(ModelSettings::new("n.bin")).expect("engine");
        let s1 = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("s1");
        let s2 = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("s2");
        let survivor = sessions
            .create_session(&other, SessionConfig::default())
            .expect("survivor");

        engines.delete_engine(&engine_id, &sessions);

        assert!(!engines.contains(&engine_id));
        assert!(!sessions.contains(&s1));
        assert!(!sessions.contains(&s2));
        assert_eq!(sessions.ids(), vec![survivor]);

        let log = stub.release_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().map(String::as_str), Some("engine:1"));

        engines.delete_engine(&engine_id, &sessions);
        engines.delete_engine("unknown", &sessions);
        assert_eq!(stub.live_engines(), 1);
    }

    #[test]
    fn preflight_rejects_empty_and_absent_files() {
        let (stub, engines, _) = managers(EngineOptions {
            preflight_model_file: true,
        });
        let dir = tempfile::tempdir().expect("tempdir");

        let absent = dir.path().join("absent.bin");
        let err = engines
            .create_engine(ModelSettings::new(absent.to_string_lossy()))
            .expect_err("absent");
        assert!(err.to_string().contains("does not exist"));

        let empty = dir.path().join("empty.bin");
        std::fs::File::create(&empty).expect("create");
        let err = engines
            .create_engine(ModelSettings::new(empty.to_string_lossy()))
            .expect_err("empty");
        assert!(err.to_string().contains("is empty"));
        assert_eq!(stub.live_engines(), 0);

        let model = dir.path().join("model.bin");
        std::fs::File::create(&model)
            .and_then(|mut f| f.write_all(b"weights"))
            .expect("write");
        engines
            .create_engine(ModelSettings::new(model.to_string_lossy()))
            .expect("valid file passes preflight");
        assert_eq!(stub.live_engines(), 1);
    }
}
