//! Prediction state machine: `Idle -> Predicting -> Idle`, with
//! `Predicting -> Cancelling -> Idle` when a cancel lands in between.

mod dispatch;
mod worker;

use std::sync::Arc;
use std::thread;

use llm_host_models::Response;
use tracing::{debug, info, warn};

use crate::error::{HostError, Result};
use crate::marshal::marshal_response;
use crate::native::InferenceBackend;
use crate::session::SessionManager;

pub use self::dispatch::{ChunkDispatcher, PredictionEvent, RequestId};

use self::worker::{submit_input, PredictionJob};

pub const DEFAULT_WORKER_NAME_PREFIX: &str = "llm_predict";

pub struct PredictionScheduler<B: InferenceBackend> {
    sessions: Arc<SessionManager<B>>,
    dispatcher: Arc<ChunkDispatcher>,
    worker_name_prefix: String,
}

impl<B: InferenceBackend> PredictionScheduler<B> {
    pub fn new(
        sessions: Arc<SessionManager<B>>,
        dispatcher: Arc<ChunkDispatcher>,
        worker_name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            dispatcher,
            worker_name_prefix: worker_name_prefix.into(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ChunkDispatcher> {
        &self.dispatcher
    }

    /// Runs the whole generation on the calling thread.
    pub fn predict_sync(&self, session_id: &str) -> Result<Response> {
        let entry = self.sessions.entry(session_id)?;
        let ticket = entry.begin_prediction(session_id, None)?;
        let guard = entry.finish_on_drop();
        info!(session_id, "sync prediction started");

        let backend = self.sessions.backend();
        let result = entry.with_native(|session| {
            submit_input(&**backend, session, &ticket.input)?;
            marshal_response(backend.predict_sync(session)?)
        });
        let cancelled = guard.finish();

        match result {
            Ok(_) if cancelled => {
                info!(session_id, "sync prediction cancelled, result discarded");
                Err(HostError::Prediction {
                    message: "prediction cancelled".to_string(),
                })
            }
            Ok(response) => {
                debug!(session_id, candidates = response.candidates.len(), "sync prediction done");
                Ok(response)
            }
            Err(err) => {
                warn!(session_id, error = %err, "sync prediction failed");
                Err(HostError::Prediction {
                    message: err.message,
                })
            }
        }
    }

    /// Starts a streamed prediction on a dedicated worker thread. Events
    /// reach `on_event` through the dispatcher, in production order, ending
    /// with exactly one terminal event.
    pub fn predict_async<F>(&self, session_id: &str, on_event: F) -> Result<RequestId>
    where
        F: FnMut(PredictionEvent) + Send + 'static,
    {
        let entry = self.sessions.entry(session_id)?;
        let (events, subscription) = self.dispatcher.open(on_event);
        let request_id = subscription.request_id();
        let ticket = entry.begin_prediction(session_id, Some(request_id))?;

        let job = PredictionJob {
            session_id: session_id.to_string(),
            entry: entry.clone(),
            backend: self.sessions.backend().clone(),
            input: ticket.input,
            cancel: ticket.cancel,
            events,
        };
        let spawned = thread::Builder::new()
            .name(format!("{}_{}", self.worker_name_prefix, request_id))
            .spawn(move || job.run());

        if let Err(err) = spawned {
            entry.finish_prediction();
            warn!(session_id, request_id, error = %err, "prediction worker spawn failed");
            return Err(HostError::Prediction {
                message: format!("Failed to spawn prediction worker: {}", err),
            });
        }

        self.dispatcher.activate(subscription);
        info!(session_id, request_id, "async prediction started");
        Ok(request_id)
    }

    /// Asks the running prediction to stop. Returns immediately; the
    /// worker acknowledges with a `Cancelled` event.
    pub fn cancel_pending_process(&self, session_id: &str) {
        let Ok(entry) = self.sessions.entry(session_id) else {
            debug!(session_id, "cancel for unknown session ignored");
            return;
        };
        if entry.request_cancel() {
            info!(session_id, "prediction cancellation requested");
        } else {
            debug!(session_id, "no prediction to cancel");
        }
    }
}
