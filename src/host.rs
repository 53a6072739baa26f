//! Composition root. Owns the managers and exposes the host-facing surface.

use std::sync::Arc;
use std::time::Duration;

use llm_host_models::{ModelSettings, Response, RuntimeConfig, SessionConfig};
use tracing::info;

use crate::config::HostConfig;
use crate::engine::{EngineManager, EngineOptions};
use crate::error::Result;
use crate::media::{FileMediaResolver, MediaResolver};
use crate::native::InferenceBackend;
use crate::scheduler::{
    ChunkDispatcher, PredictionEvent, PredictionScheduler, RequestId, DEFAULT_WORKER_NAME_PREFIX,
};
use crate::session::{PredictionState, SessionManager};

pub struct LlmHostBuilder<B: InferenceBackend> {
    backend: B,
    engine_options: EngineOptions,
    worker_name_prefix: String,
    send_poll_interval: Duration,
    media: Option<Box<dyn MediaResolver>>,
}

impl<B: InferenceBackend> LlmHostBuilder<B> {
    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    pub fn send_poll_interval(mut self, interval: Duration) -> Self {
        self.send_poll_interval = interval;
        self
    }

    pub fn media_resolver(mut self, resolver: impl MediaResolver + 'static) -> Self {
        self.media = Some(Box::new(resolver));
        self
    }

    pub fn build(self) -> LlmHost<B> {
        let backend = Arc::new(self.backend);
        let engines = Arc::new(EngineManager::new(backend.clone(), self.engine_options));
        let sessions = Arc::new(SessionManager::new(backend, engines.clone()));
        let dispatcher = Arc::new(ChunkDispatcher::new(self.send_poll_interval));
        let scheduler = PredictionScheduler::new(sessions.clone(), dispatcher, self.worker_name_prefix);

        LlmHost {
            engines,
            sessions,
            scheduler,
            media: self
                .media
                .unwrap_or_else(|| Box::new(FileMediaResolver::new())),
        }
    }
}

pub struct LlmHost<B: InferenceBackend> {
    engines: Arc<EngineManager<B>>,
    sessions: Arc<SessionManager<B>>,
    scheduler: PredictionScheduler<B>,
    media: Box<dyn MediaResolver>,
}

impl<B: InferenceBackend> LlmHost<B> {
    pub fn builder(backend: B) -> LlmHostBuilder<B> {
        LlmHostBuilder {
            backend,
            engine_options: EngineOptions::default(),
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
            send_poll_interval: Duration::from_millis(10),
            media: None,
        }
    }

    pub fn from_config(backend: B, config: &HostConfig) -> Self {
        Self::builder(backend)
            .engine_options(config.engine_options())
            .worker_name_prefix(config.prediction.worker_name_prefix.clone())
            .send_poll_interval(config.prediction.send_poll_interval())
            .build()
    }

    pub fn engines(&self) -> &EngineManager<B> {
        &self.engines
    }

    pub fn sessions(&self) -> &SessionManager<B> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &ChunkDispatcher {
        self.scheduler.dispatcher()
    }

    pub fn create_engine(&self, settings: ModelSettings) -> Result<String> {
        self.engines.create_engine(settings)
    }

    pub fn delete_engine(&self, engine_id: &str) {
        self.engines.delete_engine(engine_id, &self.sessions);
    }

    pub fn create_session(&self, engine_id: &str, config: SessionConfig) -> Result<String> {
        self.sessions.create_session(engine_id, config)
    }

    pub fn delete_session(&self, session_id: &str) {
        self.sessions.delete_session(session_id);
    }

    pub fn clone_session(&self, session_id: &str) -> Result<String> {
        self.sessions.clone_session(session_id)
    }

    pub fn update_runtime_config(&self, session_id: &str, update: &RuntimeConfig) -> Result<()> {
        self.sessions.update_runtime_config(session_id, update)
    }

    pub fn add_query_chunk(&self, session_id: &str, text: &str) -> Result<()> {
        self.sessions.add_query_chunk(session_id, text)
    }

    pub fn add_image(&self, session_id: &str, image: Vec<u8>) -> Result<()> {
        self.sessions.add_image(session_id, image)
    }

    pub fn add_audio(&self, session_id: &str, audio: Vec<u8>) -> Result<()> {
        self.sessions.add_audio(session_id, audio)
    }

    /// Resolves `uri` with the configured media resolver, then queues the
    /// bytes as an image.
    pub fn add_image_uri(&self, session_id: &str, uri: &str) -> Result<()> {
        // Fail on a bad session before touching the filesystem.
        self.sessions.state(session_id)?;
        let image = self.media.resolve(uri)?;
        self.sessions.add_image(session_id, image)
    }

    pub fn add_audio_uri(&self, session_id: &str, uri: &str) -> Result<()> {
        self.sessions.state(session_id)?;
        let audio = self.media.resolve(uri)?;
        self.sessions.add_audio(session_id, audio)
    }

    pub fn size_in_tokens(&self, session_id: &str, text: &str) -> Result<usize> {
        self.sessions.size_in_tokens(session_id, text)
    }

    pub fn state(&self, session_id: &str) -> Result<PredictionState> {
        self.sessions.state(session_id)
    }

    pub fn predict_sync(&self, session_id: &str) -> Result<Response> {
        self.scheduler.predict_sync(session_id)
    }

    pub fn predict_async<F>(&self, session_id: &str, on_event: F) -> Result<RequestId>
    where
        F: FnMut(PredictionEvent) + Send + 'static,
    {
        self.scheduler.predict_async(session_id, on_event)
    }

    pub fn cancel_pending_process(&self, session_id: &str) {
        self.scheduler.cancel_pending_process(session_id);
    }

    pub fn dispatch_pending(&self) -> usize {
        self.dispatcher().dispatch_pending()
    }

    pub fn wait_and_dispatch(&self, timeout: Duration) -> usize {
        self.dispatcher().wait_and_dispatch(timeout)
    }

    /// Deletes every session, cancelling running predictions, then every
    /// engine. Safe to call more than once.
    pub fn shutdown(&self) {
        let sessions = self.sessions.shutdown();
        let engines = self.engines.shutdown();
        if sessions > 0 || engines > 0 {
            info!(sessions, engines, "host shut down");
        }
    }
}

impl<B: InferenceBackend> Drop for LlmHost<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
