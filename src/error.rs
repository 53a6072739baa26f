use thiserror::Error;

use crate::media::MediaError;
use crate::native::NativeError;
use crate::registry::RegistryError;
use crate::session::PredictionState;

pub type Result<T, E = HostError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Engine {engine_id} not found")]
    EngineNotFound { engine_id: String },

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Cannot {operation} session {session_id} while it is {state}")]
    InvalidState {
        session_id: String,
        operation: &'static str,
        state: PredictionState,
    },

    #[error("Failed to create engine: {message}")]
    EngineCreation { message: String },

    #[error("Failed to create session: {message}")]
    SessionCreation { message: String },

    #[error("Prediction failed: {message}")]
    Prediction { message: String },

    #[error("Native call {operation} failed: {message}")]
    NativeCall {
        operation: &'static str,
        message: String,
    },

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl HostError {
    pub(crate) fn session_not_found(session_id: &str) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub(crate) fn native_call(operation: &'static str, err: NativeError) -> Self {
        Self::NativeCall {
            operation,
            message: err.message,
        }
    }

    /// Not-found errors are the only ones a caller can resolve by refreshing
    /// its handles.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EngineNotFound { .. } | Self::SessionNotFound { .. }
        )
    }
}
