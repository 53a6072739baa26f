//! Seam between the host core and the native inference library.
//!
//! Handle types own their native resource: dropping an `Engine`, `Session`
//! or `Response` releases it. Nothing outside this module sees a raw pointer.

pub mod ffi;
pub mod stub;

use std::fmt;

use llm_host_models::{ModelSettings, SessionConfig};

pub use self::ffi::CApiBackend;
pub use self::stub::StubBackend;

/// Diagnostic reported by the native layer, already copied out of (and
/// detached from) any native buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub status: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status)
    }
}

impl std::error::Error for NativeError {}

/// Native response structure still backed by native memory.
pub trait NativeResponse {
    fn candidate_count(&self) -> usize;

    /// Copies candidate `index` out of native memory.
    fn candidate(&self, index: usize) -> Result<String, NativeError>;

    fn is_done(&self) -> bool;
}

/// Function table of the native engine, in safe form.
///
/// Implementations must tolerate calls for different sessions from different
/// threads. Calls for one session are serialized by the caller.
pub trait InferenceBackend: Send + Sync + 'static {
    type Engine: Send + 'static;
    type Session: Send + 'static;
    type Response: NativeResponse;

    fn create_engine(&self, settings: &ModelSettings) -> Result<Self::Engine, NativeError>;

    fn create_session(
        &self,
        engine: &mut Self::Engine,
        config: &SessionConfig,
    ) -> Result<Self::Session, NativeError>;

    fn clone_session(&self, session: &mut Self::Session) -> Result<Self::Session, NativeError>;

    fn update_runtime_config(
        &self,
        session: &mut Self::Session,
        config: &SessionConfig,
    ) -> Result<(), NativeError>;

    fn add_query_chunk(&self, session: &mut Self::Session, text: &str) -> Result<(), NativeError>;

    fn add_image(&self, session: &mut Self::Session, image: &[u8]) -> Result<(), NativeError>;

    fn add_audio(&self, session: &mut Self::Session, audio: &[u8]) -> Result<(), NativeError>;

    /// Runs the whole generation on the calling thread.
    fn predict_sync(&self, session: &mut Self::Session) -> Result<Self::Response, NativeError>;

    /// Produces the next increment of an ongoing generation. The first call
    /// after input submission starts it; the response flags the last one.
    fn predict_step(&self, session: &mut Self::Session) -> Result<Self::Response, NativeError>;

    /// Drops whatever is left of an incremental generation that will not be
    /// stepped to completion.
    fn abort_generation(&self, _session: &mut Self::Session) -> Result<(), NativeError> {
        Ok(())
    }

    fn size_in_tokens(&self, session: &mut Self::Session, text: &str)
        -> Result<usize, NativeError>;
}
