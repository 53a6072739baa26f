//! Deterministic in-process backend. Echoes the submitted query, streams it
//! word by word, and records every release so tests can check ownership.
//!
//! Failure triggers: an empty model path or one containing `missing`, a
//! session `topK` of zero, a negative temperature, a query containing
//! `[fail]`, and predicting with no queued input.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use llm_host_models::{ModelSettings, SessionConfig};
use parking_lot::Mutex;

use super::{InferenceBackend, NativeError, NativeResponse};

const FAIL_MARKER: &str = "[fail]";

#[derive(Default)]
struct StubShared {
    step_delay: Duration,
    next_serial: AtomicU64,
    live_engines: AtomicUsize,
    live_sessions: AtomicUsize,
    live_responses: AtomicUsize,
    steps: AtomicUsize,
    releases: Mutex<Vec<String>>,
}

impl StubShared {
    fn serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_release(&self, entry: String) {
        self.releases.lock().push(entry);
    }
}

#[derive(Clone, Default)]
pub struct StubBackend {
    shared: Arc<StubShared>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every native predict call sleeps for `delay`, like a slow model would.
    pub fn with_step_delay(delay: Duration) -> Self {
        Self {
            shared: Arc::new(StubShared {
                step_delay: delay,
                ..StubShared::default()
            }),
        }
    }

    pub fn live_engines(&self) -> usize {
        self.shared.live_engines.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.shared.live_sessions.load(Ordering::SeqCst)
    }

    pub fn live_responses(&self) -> usize {
        self.shared.live_responses.load(Ordering::SeqCst)
    }

    /// Number of native predict calls made so far, sync or incremental.
    pub fn predict_calls(&self) -> usize {
        self.shared.steps.load(Ordering::SeqCst)
    }

    /// Release order, as `engine:<serial>` / `session:<serial>` entries.
    pub fn release_log(&self) -> Vec<String> {
        self.shared.releases.lock().clone()
    }

    fn simulate_work(&self) {
        self.shared.steps.fetch_add(1, Ordering::SeqCst);
        if !self.shared.step_delay.is_zero() {
            thread::sleep(self.shared.step_delay);
        }
    }

    fn respond(&self, candidates: Vec<String>, done: bool) -> StubResponse {
        self.shared.live_responses.fetch_add(1, Ordering::SeqCst);
        StubResponse {
            candidates,
            done,
            shared: self.shared.clone(),
        }
    }

    fn new_session(&self, engine_serial: u64, config: SessionConfig) -> StubSession {
        self.shared.live_sessions.fetch_add(1, Ordering::SeqCst);
        StubSession {
            serial: self.shared.serial(),
            engine_serial,
            config,
            query: String::new(),
            images: 0,
            audio: 0,
            stream: None,
            shared: self.shared.clone(),
        }
    }
}

pub struct StubEngine {
    serial: u64,
    settings: ModelSettings,
    shared: Arc<StubShared>,
}

impl StubEngine {
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }
}

impl Drop for StubEngine {
    fn drop(&mut self) {
        self.shared.live_engines.fetch_sub(1, Ordering::SeqCst);
        self.shared.record_release(format!("engine:{}", self.serial));
    }
}

pub struct StubSession {
    serial: u64,
    engine_serial: u64,
    config: SessionConfig,
    query: String,
    images: usize,
    audio: usize,
    stream: Option<VecDeque<String>>,
    shared: Arc<StubShared>,
}

impl StubSession {
    pub fn engine_serial(&self) -> u64 {
        self.engine_serial
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn take_reply(&mut self) -> Result<String, NativeError> {
        if self.query.is_empty() && self.images == 0 && self.audio == 0 {
            return Err(NativeError::new(5, "no input queued for prediction"));
        }
        if self.query.contains(FAIL_MARKER) {
            self.query.clear();
            return Err(NativeError::new(13, "native generation failed"));
        }

        let mut reply = format!("echo: {}", self.query.trim());
        if self.images > 0 {
            reply.push_str(&format!(" [images: {}]", self.images));
        }
        if self.audio > 0 {
            reply.push_str(&format!(" [audio: {}]", self.audio));
        }
        self.query.clear();
        self.images = 0;
        self.audio = 0;
        Ok(reply)
    }
}

impl Drop for StubSession {
    fn drop(&mut self) {
        self.shared.live_sessions.fetch_sub(1, Ordering::SeqCst);
        self.shared.record_release(format!("session:{}", self.serial));
    }
}

pub struct StubResponse {
    candidates: Vec<String>,
    done: bool,
    shared: Arc<StubShared>,
}

impl NativeResponse for StubResponse {
    fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    fn candidate(&self, index: usize) -> Result<String, NativeError> {
        self.candidates
            .get(index)
            .cloned()
            .ok_or_else(|| NativeError::new(-1, format!("candidate {} out of range", index)))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

impl Drop for StubResponse {
    fn drop(&mut self) {
        self.shared.live_responses.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Splits a reply into streamed pieces that concatenate back to it.
fn stream_pieces(reply: &str) -> VecDeque<String> {
    let words: Vec<&str> = reply.split(' ').collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            if i == last {
                (*word).to_string()
            } else {
                format!("{} ", word)
            }
        })
        .collect()
}

impl InferenceBackend for StubBackend {
    type Engine = StubEngine;
    type Session = StubSession;
    type Response = StubResponse;

    fn create_engine(&self, settings: &ModelSettings) -> Result<StubEngine, NativeError> {
        if settings.model_path.is_empty() {
            return Err(NativeError::new(3, "model path is empty"));
        }
        if settings.model_path.contains("missing") {
            return Err(NativeError::new(
                2,
                format!("Failed to open model file: {}", settings.model_path),
            ));
        }
        self.shared.live_engines.fetch_add(1, Ordering::SeqCst);
        Ok(StubEngine {
            serial: self.shared.serial(),
            settings: settings.clone(),
            shared: self.shared.clone(),
        })
    }

    fn create_session(
        &self,
        engine: &mut StubEngine,
        config: &SessionConfig,
    ) -> Result<StubSession, NativeError> {
        if config.top_k == Some(0) {
            return Err(NativeError::new(3, "topK must be positive"));
        }
        Ok(self.new_session(engine.serial, config.clone()))
    }

    fn clone_session(&self, session: &mut StubSession) -> Result<StubSession, NativeError> {
        Ok(self.new_session(session.engine_serial, session.config.clone()))
    }

    fn update_runtime_config(
        &self,
        session: &mut StubSession,
        config: &SessionConfig,
    ) -> Result<(), NativeError> {
        if config.temperature.is_some_and(|t| t < 0.0) {
            return Err(NativeError::new(3, "temperature must not be negative"));
        }
        session.config = config.clone();
        Ok(())
    }

    fn add_query_chunk(&self, session: &mut StubSession, text: &str) -> Result<(), NativeError> {
        session.query.push_str(text);
        Ok(())
    }

    fn add_image(&self, session: &mut StubSession, image: &[u8]) -> Result<(), NativeError> {
        if image.is_empty() {
            return Err(NativeError::new(3, "image payload is empty"));
        }
        session.images += 1;
        Ok(())
    }

    fn add_audio(&self, session: &mut StubSession, audio: &[u8]) -> Result<(), NativeError> {
        if audio.is_empty() {
            return Err(NativeError::new(3, "audio payload is empty"));
        }
        session.audio += 1;
        Ok(())
    }

    fn predict_sync(&self, session: &mut StubSession) -> Result<StubResponse, NativeError> {
        self.simulate_work();
        let reply = session.take_reply()?;
        Ok(self.respond(vec![reply], true))
    }

    fn predict_step(&self, session: &mut StubSession) -> Result<StubResponse, NativeError> {
        self.simulate_work();
        if session.stream.is_none() {
            let reply = session.take_reply()?;
            session.stream = Some(stream_pieces(&reply));
        }

        let stream = session.stream.get_or_insert_with(VecDeque::new);
        let piece = stream.pop_front().unwrap_or_default();
        let done = stream.is_empty();
        if done {
            session.stream = None;
        }
        Ok(self.respond(vec![piece], done))
    }

    fn abort_generation(&self, session: &mut StubSession) -> Result<(), NativeError> {
        session.stream = None;
        session.query.clear();
        session.images = 0;
        session.audio = 0;
        Ok(())
    }

    fn size_in_tokens(&self, _session: &mut StubSession, text: &str) -> Result<usize, NativeError> {
        Ok(text.split_whitespace().count())
    }
}

#[cfg(test)]
mod tests {
    use super::{stream_pieces, StubBackend};
    use crate::marshal::marshal_response;
    use crate::native::InferenceBackend;
    use llm_host_models::{ModelSettings, SessionConfig};

    #[test]
    fn stream_pieces_concatenate_back() {
        let pieces = stream_pieces("echo: Hello big world");
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.iter().cloned().collect::<String>(), "echo: Hello big world");
    }

    #[test]
    fn streaming_marks_only_the_last_piece_done() {
        let backend = StubBackend::new();
        let mut engine = backend
            .create_engine(&ModelSettings::new("m.bin"))
            .ok()
            .expect("engine");
        let mut session = backend
            .create_session(&mut engine, &SessionConfig::default())
            .ok()
            .expect("session");
        backend
            .add_query_chunk(&mut session, "Hello world")
            .expect("chunk");

        let mut text = String::new();
        loop {
            let chunk = marshal_response(backend.predict_step(&mut session).ok().expect("step"))
                .expect("marshal");
            text.push_str(&chunk.candidates.concat());
            if chunk.done {
                break;
            }
        }

        assert_eq!(text, "echo: Hello world");
        assert_eq!(backend.live_responses(), 0);
        assert!(backend.predict_sync(&mut session).is_err());
    }

    #[test]
    fn sessions_remember_their_engine_and_config() {
        let backend = StubBackend::new();
        let mut engine = backend
            .create_engine(&ModelSettings::new("m.bin"))
            .ok()
            .expect("engine");
        assert_eq!(engine.settings().model_path, "m.bin");

        let config = SessionConfig {
            top_k: Some(8),
            ..SessionConfig::default()
        };
        let mut session = backend
            .create_session(&mut engine, &config)
            .ok()
            .expect("session");
        let clone = backend.clone_session(&mut session).ok().expect("clone");
        assert_eq!(session.engine_serial(), 1);
        assert_eq!(clone.engine_serial(), 1);
        assert_eq!(clone.config(), &config);

        let warmer = SessionConfig {
            temperature: Some(0.9),
            ..config.clone()
        };
        backend
            .update_runtime_config(&mut session, &warmer)
            .expect("update");
        assert_eq!(session.config(), &warmer);
        assert_eq!(clone.config(), &config);
    }

    #[test]
    fn drops_are_logged_in_order() {
        let backend = StubBackend::new();
        let mut engine = backend
            .create_engine(&ModelSettings::new("m.bin"))
            .ok()
            .expect("engine");
        let session = backend
            .create_session(&mut engine, &SessionConfig::default())
            .ok()
            .expect("session");

        drop(session);
        drop(engine);
        assert_eq!(backend.release_log(), vec!["session:2", "engine:1"]);
        assert_eq!(backend.live_sessions(), 0);
        assert_eq!(backend.live_engines(), 0);
    }
}
