use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use llm_host_models::SessionConfig;

use crate::scheduler::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionState {
    Idle,
    Predicting,
    Cancelling,
}

impl fmt::Display for PredictionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Predicting => "predicting",
            Self::Cancelling => "cancelling",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputItem {
    Text(String),
    Image(Vec<u8>),
    Audio(Vec<u8>),
}

/// Inputs accumulated between predictions, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingInput {
    items: Vec<InputItem>,
}

impl PendingInput {
    pub fn push(&mut self, item: InputItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[InputItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item {
                InputItem::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn image_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, InputItem::Image(_)))
            .count()
    }

    pub fn audio_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, InputItem::Audio(_)))
            .count()
    }
}

/// The request being assembled or executed for one session.
#[derive(Debug, Default)]
pub(crate) struct PendingRequest {
    pub(crate) input: PendingInput,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) request_id: Option<RequestId>,
}

/// Everything guarded by the session's control lock.
#[derive(Debug)]
pub(crate) struct SessionControl {
    pub(crate) state: PredictionState,
    pub(crate) config: SessionConfig,
    pub(crate) pending: PendingRequest,
}

impl SessionControl {
    pub(crate) fn new(config: SessionConfig) -> Self {
        Self {
            state: PredictionState::Idle,
            config,
            pending: PendingRequest::default(),
        }
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.pending.cancel.load(Ordering::SeqCst)
    }
}

/// What a prediction takes out of the session when it starts.
pub(crate) struct PredictionTicket {
    pub(crate) input: PendingInput,
    pub(crate) cancel: Arc<AtomicBool>,
}

/// Point-in-time view of a session, for hosts and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub engine_id: String,
    pub state: PredictionState,
    pub config: SessionConfig,
    pub pending: PendingInput,
    pub active_request: Option<RequestId>,
}

#[cfg(test)]
mod tests {
    use super::{InputItem, PendingInput, PredictionState};

    #[test]
    fn pending_input_keeps_order_and_counts() {
        let mut input = PendingInput::default();
        input.push(InputItem::Text("Describe ".to_string()));
        input.push(InputItem::Image(vec![1, 2, 3]));
        input.push(InputItem::Text("this".to_string()));

        assert_eq!(input.text(), "Describe this");
        assert_eq!(input.image_count(), 1);
        assert_eq!(input.audio_count(), 0);
        assert!(matches!(input.items()[1], InputItem::Image(_)));
    }

    #[test]
    fn states_render_lowercase() {
        assert_eq!(PredictionState::Cancelling.to_string(), "cancelling");
    }
}
