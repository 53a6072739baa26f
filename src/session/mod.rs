//! Session registry and per-session state.
//!
//! Every session carries two locks. The control lock guards the prediction
//! state, the pending input and the configuration, and is only ever held
//! briefly. The native lock guards the backend handle and is held across
//! native calls. When both are needed the control lock is taken first.

mod state;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use llm_host_models::{RuntimeConfig, SessionConfig};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::engine::EngineManager;
use crate::error::{HostError, Result};
use crate::native::InferenceBackend;
use crate::registry::HandleRegistry;
use crate::scheduler::RequestId;

pub use self::state::{InputItem, PendingInput, PredictionState, SessionInfo};
pub(crate) use self::state::{PredictionTicket, SessionControl};

/// Native session plus a reference to the engine it was built from.
pub(crate) struct NativeSession<B: InferenceBackend> {
    // Field order matters: the session handle drops before the engine.
    pub(crate) handle: B::Session,
    engine: Arc<Mutex<B::Engine>>,
}

pub struct SessionEntry<B: InferenceBackend> {
    engine_id: String,
    control: Mutex<SessionControl>,
    native: Mutex<NativeSession<B>>,
}

impl<B: InferenceBackend> SessionEntry<B> {
    fn new(engine_id: String, config: SessionConfig, native: NativeSession<B>) -> Self {
        Self {
            engine_id,
            control: Mutex::new(SessionControl::new(config)),
            native: Mutex::new(native),
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn state(&self) -> PredictionState {
        self.control.lock().state
    }

    fn idle_control(
        &self,
        session_id: &str,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, SessionControl>> {
        let control = self.control.lock();
        if control.state != PredictionState::Idle {
            return Err(HostError::InvalidState {
                session_id: session_id.to_string(),
                operation,
                state: control.state,
            });
        }
        Ok(control)
    }

    /// Moves an idle session to `Predicting` and hands out its pending input.
    pub(crate) fn begin_prediction(
        &self,
        session_id: &str,
        request_id: Option<RequestId>,
    ) -> Result<PredictionTicket> {
        let mut control = self.idle_control(session_id, "predict")?;
        control.state = PredictionState::Predicting;
        control.pending.request_id = request_id;
        control.pending.cancel = Default::default();
        Ok(PredictionTicket {
            input: std::mem::take(&mut control.pending.input),
            cancel: control.pending.cancel.clone(),
        })
    }

    /// Returns the session to `Idle`. Reports whether cancellation had been
    /// requested for the prediction that just ended.
    pub(crate) fn finish_prediction(&self) -> bool {
        let mut control = self.control.lock();
        let cancelled = control.is_cancel_requested();
        control.state = PredictionState::Idle;
        control.pending.request_id = None;
        cancelled
    }

    /// Guard that returns the session to `Idle` if the prediction unwinds.
    pub(crate) fn finish_on_drop(&self) -> FinishOnDrop<'_, B> {
        FinishOnDrop {
            entry: self,
            armed: true,
        }
    }

    /// Flags the running prediction for cancellation. Returns false when
    /// there was nothing to cancel.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut control = self.control.lock();
        if control.state != PredictionState::Predicting {
            return false;
        }
        control.pending.cancel.store(true, Ordering::SeqCst);
        control.state = PredictionState::Cancelling;
        true
    }

    /// Runs `f` with exclusive access to the native session handle.
    pub(crate) fn with_native<R>(&self, f: impl FnOnce(&mut B::Session) -> R) -> R {
        let mut native = self.native.lock();
        f(&mut native.handle)
    }

    fn info(&self) -> SessionInfo {
        let control = self.control.lock();
        SessionInfo {
            engine_id: self.engine_id.clone(),
            state: control.state,
            config: control.config.clone(),
            pending: control.pending.input.clone(),
            active_request: control.pending.request_id,
        }
    }
}

pub(crate) struct FinishOnDrop<'a, B: InferenceBackend> {
    entry: &'a SessionEntry<B>,
    armed: bool,
}

impl<B: InferenceBackend> FinishOnDrop<'_, B> {
    /// Same as [`SessionEntry::finish_prediction`], disarming the guard.
    pub(crate) fn finish(mut self) -> bool {
        self.armed = false;
        self.entry.finish_prediction()
    }
}

impl<B: InferenceBackend> Drop for FinishOnDrop<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.finish_prediction();
        }
    }
}

pub struct SessionManager<B: InferenceBackend> {
    backend: Arc<B>,
    engines: Arc<EngineManager<B>>,
    sessions: HandleRegistry<Arc<SessionEntry<B>>>,
}

impl<B: InferenceBackend> SessionManager<B> {
    pub fn new(backend: Arc<B>, engines: Arc<EngineManager<B>>) -> Self {
        Self {
            backend,
            engines,
            sessions: HandleRegistry::new(),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub(crate) fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry<B>>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| HostError::session_not_found(session_id))
    }

    pub fn create_session(&self, engine_id: &str, config: SessionConfig) -> Result<String> {
        let engine = self
            .engines
            .lookup(engine_id)
            .ok_or_else(|| HostError::EngineNotFound {
                engine_id: engine_id.to_string(),
            })?;

        let handle = {
            let mut native_engine = engine.native.lock();
            self.backend.create_session(&mut native_engine, &config)
        }
        .map_err(|err| {
            warn!(engine_id, error = %err, "native session factory failed");
            HostError::SessionCreation {
                message: err.message,
            }
        })?;

        let native = NativeSession {
            handle,
            engine: engine.native.clone(),
        };
        let entry = SessionEntry::new(engine_id.to_string(), config, native);
        let session_id = self.sessions.insert(Arc::new(entry))?;

        // A concurrent engine delete may have swept sessions before this one
        // was registered.
        if !self.engines.contains(engine_id) {
            self.sessions.remove(&session_id);
            return Err(HostError::EngineNotFound {
                engine_id: engine_id.to_string(),
            });
        }

        info!(engine_id, session_id = %session_id, "session created");
        Ok(session_id)
    }

    pub fn delete_session(&self, session_id: &str) {
        let Some(entry) = self.sessions.remove(session_id) else {
            debug!(session_id, "delete of unknown session ignored");
            return;
        };
        release(session_id, entry);
    }

    /// Deletes every session bound to `engine_id`. Returns how many went.
    pub(crate) fn delete_sessions_for_engine(&self, engine_id: &str) -> usize {
        let removed = self
            .sessions
            .remove_where(|entry| entry.engine_id() == engine_id);
        let count = removed.len();
        for (session_id, entry) in removed {
            release(&session_id, entry);
        }
        count
    }

    pub fn clone_session(&self, session_id: &str) -> Result<String> {
        let entry = self.entry(session_id)?;
        let control = entry.idle_control(session_id, "clone")?;

        let clone_native = {
            let mut native = entry.native.lock();
            let handle = self
                .backend
                .clone_session(&mut native.handle)
                .map_err(|err| HostError::native_call("clone_session", err))?;
            NativeSession {
                handle,
                engine: native.engine.clone(),
            }
        };

        let clone = SessionEntry::new(entry.engine_id.clone(), control.config.clone(), clone_native);
        let clone_id = self.sessions.insert(Arc::new(clone))?;
        info!(session_id, clone_id = %clone_id, "session cloned");
        Ok(clone_id)
    }

    pub fn update_runtime_config(&self, session_id: &str, update: &RuntimeConfig) -> Result<()> {
        let entry = self.entry(session_id)?;
        let mut control = entry.idle_control(session_id, "update the runtime config of")?;

        let next = control.config.merged(update);
        entry
            .with_native(|native| self.backend.update_runtime_config(native, &next))
            .map_err(|err| HostError::native_call("update_runtime_config", err))?;

        control.config = next;
        debug!(session_id, "runtime config updated");
        Ok(())
    }

    pub fn add_query_chunk(&self, session_id: &str, text: &str) -> Result<()> {
        self.push_input(session_id, "add a query chunk to", InputItem::Text(text.to_string()))
    }

    pub fn add_image(&self, session_id: &str, image: Vec<u8>) -> Result<()> {
        self.push_input(session_id, "add an image to", InputItem::Image(image))
    }

    pub fn add_audio(&self, session_id: &str, audio: Vec<u8>) -> Result<()> {
        self.push_input(session_id, "add audio to", InputItem::Audio(audio))
    }

    fn push_input(&self, session_id: &str, operation: &'static str, item: InputItem) -> Result<()> {
        let entry = self.entry(session_id)?;
        let mut control = entry.idle_control(session_id, operation)?;
        control.pending.input.push(item);
        Ok(())
    }

    /// Counts tokens with the session's tokenizer. Waits for the native
    /// handle, so during an async prediction it runs between two steps.
    pub fn size_in_tokens(&self, session_id: &str, text: &str) -> Result<usize> {
        let entry = self.entry(session_id)?;
        entry
            .with_native(|native| self.backend.size_in_tokens(native, text))
            .map_err(|err| HostError::native_call("size_in_tokens", err))
    }

    pub fn state(&self, session_id: &str) -> Result<PredictionState> {
        Ok(self.entry(session_id)?.state())
    }

    pub fn engine_id(&self, session_id: &str) -> Result<String> {
        Ok(self.entry(session_id)?.engine_id().to_string())
    }

    pub fn config(&self, session_id: &str) -> Result<SessionConfig> {
        Ok(self.entry(session_id)?.control.lock().config.clone())
    }

    pub fn pending_input(&self, session_id: &str) -> Result<PendingInput> {
        Ok(self.entry(session_id)?.control.lock().pending.input.clone())
    }

    pub fn describe(&self, session_id: &str) -> Result<SessionInfo> {
        Ok(self.entry(session_id)?.info())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.ids()
    }

    pub fn ids_for_engine(&self, engine_id: &str) -> Vec<String> {
        self.sessions
            .ids_where(|entry| entry.engine_id() == engine_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn shutdown(&self) -> usize {
        let drained = self.sessions.drain();
        let count = drained.len();
        for (session_id, entry) in drained {
            release(&session_id, entry);
        }
        count
    }
}

/// Cancels whatever the removed session was doing and lets go of it. The
/// native handle is freed here unless a worker still holds the entry.
fn release<B: InferenceBackend>(session_id: &str, entry: Arc<SessionEntry<B>>) {
    if entry.request_cancel() {
        info!(session_id, "cancelled in-flight prediction of deleted session");
    }
    if Arc::strong_count(&entry) > 1 {
        debug!(session_id, "native session release deferred to the running prediction");
    }
    info!(session_id, "session deleted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineManager, EngineOptions};
    use crate::native::StubBackend;
    use llm_host_models::ModelSettings;

    fn setup() -> (StubBackend, Arc<EngineManager<StubBackend>>, SessionManager<StubBackend>) {
        let stub = StubBackend::new();
        let backend = Arc::new(stub.clone());
        let engines = Arc::new(EngineManager::new(backend.clone(), EngineOptions::default()));
        let sessions = SessionManager::new(backend, engines.clone());
        (stub, engines, sessions)
    }

    fn engine(engines: &EngineManager<StubBackend>) -> String {
        engines
            .create_engine(ModelSettings::new("m.bin"))
            .expect("engine")
    }

    #[test]
    fn new_sessions_start_idle_with_empty_input() {
        let (_, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let config = SessionConfig {
            top_k: Some(40),
            temperature: Some(0.8),
            ..SessionConfig::default()
        };

        let id = sessions.create_session(&engine_id, config.clone()).expect("session");
        let info = sessions.describe(&id).expect("describe");

        assert_eq!(info.engine_id, engine_id);
        assert_eq!(info.state, PredictionState::Idle);
        assert_eq!(info.config, config);
        assert!(info.pending.is_empty());
        assert_eq!(info.active_request, None);
        assert_eq!(sessions.ids_for_engine(&engine_id), vec![id]);
    }

    #[test]
    fn unknown_engine_and_native_failure_are_reported() {
        let (stub, engines, sessions) = setup();
        let err = sessions
            .create_session("nope", SessionConfig::default())
            .expect_err("unknown engine");
        assert!(matches!(err, HostError::EngineNotFound { .. }));
        assert!(err.is_not_found());

        let engine_id = engine(&engines);
        let err = sessions
            .create_session(
                &engine_id,
                SessionConfig {
                    top_k: Some(0),
                    ..SessionConfig::default()
                },
            )
            .expect_err("topK 0 is rejected natively");
        match err {
            HostError::SessionCreation { ref message } => {
                assert_eq!(message, "topK must be positive");
                assert!(!err.is_not_found());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(sessions.is_empty());
        assert_eq!(stub.live_sessions(), 0);
    }

    #[test]
    fn delete_is_idempotent_and_releases_native_session() {
        let (stub, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let id = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("session");

        sessions.delete_session(&id);
        sessions.delete_session(&id);
        sessions.delete_session("never-existed");

        assert_eq!(stub.live_sessions(), 0);
        assert!(matches!(
            sessions.add_query_chunk(&id, "late"),
            Err(HostError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn clone_is_independent_of_its_source() {
        let (stub, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let source = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("session");
        sessions.add_query_chunk(&source, "kept in source").expect("chunk");

        let clone = sessions.clone_session(&source).expect("clone");
        assert_ne!(clone, source);
        assert_eq!(sessions.engine_id(&clone).expect("engine"), engine_id);
        assert!(sessions.pending_input(&clone).expect("pending").is_empty());

        sessions
            .update_runtime_config(
                &clone,
                &RuntimeConfig {
                    temperature: Some(0.2),
                    ..RuntimeConfig::default()
                },
            )
            .expect("update clone");
        sessions.delete_session(&clone);

        assert_eq!(sessions.config(&source).expect("config").temperature, None);
        assert_eq!(
            sessions.pending_input(&source).expect("pending").text(),
            "kept in source"
        );
        assert_eq!(stub.live_sessions(), 1);
    }

    #[test]
    fn busy_session_rejects_mutation_without_side_effects() {
        let (_, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let id = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("session");
        let entry = sessions.entry(&id).expect("entry");
        entry.begin_prediction(&id, None).expect("begin");
        let before = sessions.describe(&id).expect("describe");

        let update = RuntimeConfig {
            top_k: Some(5),
            ..RuntimeConfig::default()
        };
        for err in [
            sessions.add_query_chunk(&id, "x").expect_err("chunk"),
            sessions.add_image(&id, vec![1]).expect_err("image"),
            sessions.update_runtime_config(&id, &update).expect_err("update"),
            sessions.clone_session(&id).map(|_| ()).expect_err("clone"),
        ] {
            assert!(matches!(
                err,
                HostError::InvalidState {
                    state: PredictionState::Predicting,
                    ..
                }
            ));
        }
        assert_eq!(sessions.describe(&id).expect("describe"), before);
        assert_eq!(sessions.len(), 1);

        assert!(!entry.finish_prediction());
        assert_eq!(sessions.state(&id).expect("state"), PredictionState::Idle);
    }

    #[test]
    fn failed_native_update_keeps_stored_config() {
        let (_, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let id = sessions
            .create_session(
                &engine_id,
                SessionConfig {
                    temperature: Some(0.8),
                    ..SessionConfig::default()
                },
            )
            .expect("session");

        let err = sessions
            .update_runtime_config(
                &id,
                &RuntimeConfig {
                    temperature: Some(-1.0),
                    ..RuntimeConfig::default()
                },
            )
            .expect_err("negative temperature");
        assert!(matches!(err, HostError::NativeCall { .. }));
        assert_eq!(sessions.config(&id).expect("config").temperature, Some(0.8));
    }

    #[test]
    fn cancel_only_applies_to_running_predictions() {
        let (_, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let id = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("session");
        let entry = sessions.entry(&id).expect("entry");

        assert!(!entry.request_cancel());
        let ticket = entry.begin_prediction(&id, Some(7)).expect("begin");
        assert_eq!(sessions.describe(&id).expect("describe").active_request, Some(7));
        assert!(entry.request_cancel());
        assert_eq!(entry.state(), PredictionState::Cancelling);
        assert!(ticket.cancel.load(Ordering::SeqCst));
        assert!(entry.finish_prediction());

        let ticket = entry.begin_prediction(&id, None).expect("begin again");
        assert!(!ticket.cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn token_count_goes_through_the_native_tokenizer() {
        let (_, engines, sessions) = setup();
        let engine_id = engine(&engines);
        let id = sessions
            .create_session(&engine_id, SessionConfig::default())
            .expect("session");

        assert_eq!(sessions.size_in_tokens(&id, "one two three").expect("size"), 3);
        assert!(sessions.size_in_tokens("missing", "x").is_err());
    }
}
