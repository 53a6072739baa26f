use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use llm_host_models::Response;
use tracing::{debug, info, warn};

use crate::marshal::marshal_response;
use crate::native::{InferenceBackend, NativeError};
use crate::session::{InputItem, PendingInput, SessionEntry};

use super::dispatch::{ChunkSender, PredictionEvent, RequestId, SendOutcome};

/// Pushes the accumulated input into the native session, in order.
pub(crate) fn submit_input<B: InferenceBackend>(
    backend: &B,
    session: &mut B::Session,
    input: &PendingInput,
) -> Result<(), NativeError> {
    for item in input.items() {
        match item {
            InputItem::Text(text) => backend.add_query_chunk(session, text)?,
            InputItem::Image(bytes) => backend.add_image(session, bytes)?,
            InputItem::Audio(bytes) => backend.add_audio(session, bytes)?,
        }
    }
    Ok(())
}

/// How a streamed prediction ended.
enum Outcome {
    Finished(Response),
    Failed(String),
    Cancelled,
    /// The dispatcher went away; nobody is listening.
    Abandoned,
}

/// Terminal event for `outcome`, or `None` when nobody is listening. A cancel
/// accepted after the last step still wins over a finished generation.
fn terminal_event(
    session_id: &str,
    request_id: RequestId,
    outcome: Outcome,
    cancel_accepted: bool,
) -> Option<PredictionEvent> {
    let event = match outcome {
        Outcome::Finished(_) if cancel_accepted => {
            info!(session_id, request_id, "async prediction cancelled after its last step");
            PredictionEvent::Cancelled
        }
        Outcome::Finished(response) => {
            info!(session_id, request_id, "async prediction finished");
            PredictionEvent::Chunk(response)
        }
        Outcome::Failed(message) => {
            warn!(session_id, request_id, %message, "async prediction failed");
            PredictionEvent::Error(message)
        }
        Outcome::Cancelled => {
            info!(session_id, request_id, "async prediction cancelled");
            PredictionEvent::Cancelled
        }
        Outcome::Abandoned => {
            debug!(session_id, request_id, "async prediction abandoned");
            return None;
        }
    };
    Some(event)
}

pub(crate) struct PredictionJob<B: InferenceBackend> {
    pub(crate) session_id: String,
    pub(crate) entry: Arc<SessionEntry<B>>,
    pub(crate) backend: Arc<B>,
    pub(crate) input: PendingInput,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) events: ChunkSender,
}

impl<B: InferenceBackend> PredictionJob<B> {
    /// Body of the worker thread.
    pub(crate) fn run(self) {
        let guard = self.entry.finish_on_drop();
        let outcome = self.produce();

        if !matches!(outcome, Outcome::Finished(_)) {
            let aborted = self
                .entry
                .with_native(|session| self.backend.abort_generation(session));
            if let Err(err) = aborted {
                warn!(session_id = %self.session_id, error = %err, "native abort failed");
            }
        }

        // The session is usable again before the host hears about the end.
        let cancel_accepted = guard.finish();

        let request_id = self.events.request_id();
        let terminal = terminal_event(&self.session_id, request_id, outcome, cancel_accepted);
        if let Some(terminal) = terminal {
            self.events.send_terminal(terminal);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn produce(&self) -> Outcome {
        let submitted = self
            .entry
            .with_native(|session| submit_input(&*self.backend, session, &self.input));
        if let Err(err) = submitted {
            return Outcome::Failed(err.message);
        }

        loop {
            if self.cancelled() {
                return Outcome::Cancelled;
            }

            // Native lock is per step so token counting can slip in between.
            let step = self.entry.with_native(|session| {
                self.backend
                    .predict_step(session)
                    .and_then(marshal_response)
            });
            let chunk = match step {
                Ok(chunk) => chunk,
                Err(err) => return Outcome::Failed(err.message),
            };

            if self.cancelled() {
                return Outcome::Cancelled;
            }
            if chunk.done {
                return Outcome::Finished(chunk);
            }

            match self.events.send_chunk(PredictionEvent::Chunk(chunk), &self.cancel) {
                SendOutcome::Sent => {}
                SendOutcome::Cancelled => return Outcome::Cancelled,
                SendOutcome::Disconnected => return Outcome::Abandoned,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{terminal_event, Outcome};
    use crate::scheduler::PredictionEvent;
    use llm_host_models::Response;

    fn finished() -> Outcome {
        Outcome::Finished(Response::new(vec!["done".to_string()], true))
    }

    #[test]
    fn cancel_accepted_after_the_last_step_reports_cancelled() {
        assert_eq!(
            terminal_event("s", 1, finished(), true),
            Some(PredictionEvent::Cancelled)
        );
        assert_eq!(
            terminal_event("s", 1, finished(), false),
            Some(PredictionEvent::Chunk(Response::new(vec!["done".to_string()], true)))
        );
    }

    #[test]
    fn failures_keep_their_message_and_abandoned_stays_silent() {
        assert_eq!(
            terminal_event("s", 2, Outcome::Failed("boom".to_string()), true),
            Some(PredictionEvent::Error("boom".to_string()))
        );
        assert_eq!(terminal_event("s", 3, Outcome::Abandoned, false), None);
    }
}
